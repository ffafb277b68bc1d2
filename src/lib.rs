//! Replicore: a partitioned, primary/backup replicated state-machine
//! framework. Each data partition is served by one primary and several
//! secondaries under configurations owned by an external meta-server;
//! writes go through a two-phase-commit pipeline backed by a shared
//! write-ahead log, and lagging replicas catch up through the learner
//! protocol.

#[macro_use]
mod utils;

mod app;
mod base;
mod fd;
mod messages;
mod replica;
mod stub;
mod wal;

pub use app::{
    AppKind, CheckpointApplyMode, KvCommand, KvResult, SimpleKvApp, StateApp,
};
pub use base::{
    Ballot, ConfigType, Decree, ErrCode, Gpid, LearnSignature, LearnerStatus,
    NodeAddr, PartitionConfiguration, PartitionStatus, ReplicaConfiguration,
    ReplicationConfig,
};
pub use fd::{
    BeaconFollowup, FailureDetector, FdEvent, FdOptions, MetaFailureDetector,
};
pub use messages::{
    Beacon, BeaconAck, ConfigProposalRequest, ConfigUpdateResponse,
    GroupCheckRequest, GroupCheckResponse, LearnRequest, LearnResponse,
    LearnState, LearnType, NodeReport, PrepareRequest, PrepareResponse,
    ReplicaLoadInfo, ReplicaMsg,
};
pub use replica::{
    CommitMode, Mutation, MutationHeader, PrepareList, Replica, ReplicaEvent,
    ReplicaRuntimeInfo, StubNotice, RPC_WRITE_EMPTY,
};
pub use stub::{parse_replica_dir_name, replica_dir_name, ReplicaStub};
pub use utils::{ReplicoreError, Timer};
pub use wal::{AppendAck, LogFileHeader, LogOptions, MutationLog};
