//! Core identifier and configuration types shared by every module.

use std::fmt;
use std::net::SocketAddr;

use crate::utils::ReplicoreError;

use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// Partition ballot number; bumped by every configuration change.
pub type Ballot = u64;

/// Position in a partition's committed log; `0` is pre-genesis.
pub type Decree = u64;

/// Opaque learner-epoch nonce minted by the primary.
pub type LearnSignature = u64;

/// Address of a replica or meta server process.
pub type NodeAddr = SocketAddr;

/// Global partition id: primary key of a partition everywhere.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Gpid {
    pub app_id: u32,
    pub partition_index: u32,
}

impl Gpid {
    pub fn new(app_id: u32, partition_index: u32) -> Self {
        Gpid {
            app_id,
            partition_index,
        }
    }

    /// Dispatch hash used to pin all of a partition's work to one worker.
    pub fn to_hash(self) -> u64 {
        (self.app_id ^ self.partition_index) as u64
    }
}

impl fmt::Display for Gpid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

/// Role of a replica within its partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, GetSize,
)]
pub enum PartitionStatus {
    Inactive,
    Error,
    Primary,
    Secondary,
    PotentialSecondary,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PartitionStatus::Inactive => "Inactive",
            PartitionStatus::Error => "Error",
            PartitionStatus::Primary => "Primary",
            PartitionStatus::Secondary => "Secondary",
            PartitionStatus::PotentialSecondary => "PotentialSecondary",
        };
        write!(f, "{}", s)
    }
}

/// Progression of a learner's catch-up attempt. `Failed` is an orthogonal
/// sink reachable from every other state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub enum LearnerStatus {
    WithoutPrepare,
    WithPrepareTransient,
    WithPrepare,
    Succeeded,
    Failed,
}

impl fmt::Display for LearnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reconfiguration proposal kinds issued by (or relayed through) the
/// meta-server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub enum ConfigType {
    AssignPrimary,
    UpgradeToPrimary,
    AddSecondary,
    UpgradeToSecondary,
    DowngradeToSecondary,
    DowngradeToInactive,
    Remove,
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Wire-visible failure classification carried in message replies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, GetSize,
)]
pub enum ErrCode {
    Ok,
    /// Proposal/prepare carried a ballot below ours; no state change.
    StaleBallot,
    /// Operation hit a replica in the wrong role.
    InvalidState,
    /// Replica is transiently inactive during reconfiguration; retry.
    InactiveState,
    /// Learner signature mismatch; learner must restart its epoch.
    WrongChecksum,
    /// Primary could not materialize a checkpoint for the learner.
    GetLearnStateFailed,
    /// App write/flush/checkpoint failed locally.
    LocalAppFailure,
    /// Write-ahead log I/O error.
    LogIoFailure,
    /// No acceptable meta leader is reachable.
    MetaUnavailable,
    /// RPC did not return within its window.
    Timeout,
    /// Target object (e.g. learner record) is unknown to the receiver.
    ObjectNotFound,
    /// Meta-server rejected a configuration as permanently out of date.
    InvalidVersion,
}

impl ErrCode {
    pub fn is_ok(self) -> bool {
        self == ErrCode::Ok
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Authoritative per-partition configuration owned by the meta-server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfiguration {
    pub gpid: Gpid,
    pub ballot: Ballot,
    pub max_replica_count: u32,
    pub primary: Option<NodeAddr>,
    pub secondaries: Vec<NodeAddr>,
    pub last_committed_decree: Decree,
    pub app_type: String,
}

impl PartitionConfiguration {
    /// Derives one node's view of this configuration.
    pub fn replica_config_for(&self, node: NodeAddr) -> ReplicaConfiguration {
        let status = if self.primary == Some(node) {
            PartitionStatus::Primary
        } else if self.secondaries.contains(&node) {
            PartitionStatus::Secondary
        } else {
            PartitionStatus::Inactive
        };
        ReplicaConfiguration {
            gpid: self.gpid,
            ballot: self.ballot,
            primary: self.primary,
            status,
            learner_signature: None,
        }
    }
}

/// One replica's derived view of its partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfiguration {
    pub gpid: Gpid,
    pub ballot: Ballot,
    pub primary: Option<NodeAddr>,
    pub status: PartitionStatus,
    pub learner_signature: Option<LearnSignature>,
}

/// Removes `node` from `nodes` if present; returns whether it was there.
pub fn remove_node(node: NodeAddr, nodes: &mut Vec<NodeAddr>) -> bool {
    let before = nodes.len();
    nodes.retain(|n| *n != node);
    nodes.len() != before
}

/// Recognized replication options, all overridable from a TOML snippet via
/// `parsed_config!`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    pub prepare_timeout_ms_for_secondaries: u64,
    pub prepare_timeout_ms_for_potential_secondaries: u64,

    /// How far prepares may run ahead of commit.
    pub staleness_for_commit: u64,
    pub max_mutation_count_in_prepare_list: usize,
    pub mutation_2pc_min_replica_count: usize,

    pub group_check_interval_ms: u64,

    pub checkpoint_interval_seconds: u64,
    pub checkpoint_min_decree_gap: u64,

    pub gc_interval_ms: u64,
    pub gc_memory_replica_interval_ms: u64,
    pub gc_disk_error_replica_interval_seconds: u64,

    pub fd_check_interval_seconds: u64,
    pub fd_beacon_interval_seconds: u64,
    pub fd_lease_seconds: u64,
    pub fd_grace_seconds: u64,

    pub log_private_disabled: bool,
    pub log_private_file_size_mb: u64,
    pub log_private_batch_buffer_kb: u64,
    pub log_private_force_flush: bool,
    pub log_shared_file_size_mb: u64,
    pub log_shared_batch_buffer_kb: u64,
    pub log_shared_force_flush: bool,
    /// Upper bound on how long an append may sit in the pending buffer.
    pub log_pending_max_ms: u64,

    pub config_sync_interval_ms: u64,
    pub lb_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            prepare_timeout_ms_for_secondaries: 1000,
            prepare_timeout_ms_for_potential_secondaries: 3000,
            staleness_for_commit: 10,
            max_mutation_count_in_prepare_list: 500,
            mutation_2pc_min_replica_count: 2,
            group_check_interval_ms: 10_000,
            checkpoint_interval_seconds: 100,
            checkpoint_min_decree_gap: 10_000,
            gc_interval_ms: 30_000,
            gc_memory_replica_interval_ms: 300_000,
            gc_disk_error_replica_interval_seconds: 3600,
            fd_check_interval_seconds: 2,
            fd_beacon_interval_seconds: 3,
            fd_lease_seconds: 9,
            fd_grace_seconds: 10,
            log_private_disabled: false,
            log_private_file_size_mb: 32,
            log_private_batch_buffer_kb: 128,
            log_private_force_flush: false,
            log_shared_file_size_mb: 32,
            log_shared_batch_buffer_kb: 256,
            log_shared_force_flush: false,
            log_pending_max_ms: 25,
            config_sync_interval_ms: 30_000,
            lb_interval_ms: 10_000,
        }
    }
}

impl ReplicationConfig {
    /// Rejects option combinations that would wedge the protocol.
    pub fn sanity_check(&self) -> Result<(), ReplicoreError> {
        if self.staleness_for_commit as usize
            > self.max_mutation_count_in_prepare_list
        {
            return logged_err!("config";
                "staleness_for_commit {} exceeds prepare list capacity {}",
                self.staleness_for_commit,
                self.max_mutation_count_in_prepare_list);
        }
        if self.mutation_2pc_min_replica_count == 0 {
            return logged_err!("config";
                "mutation_2pc_min_replica_count must be at least 1");
        }
        if self.fd_lease_seconds >= self.fd_grace_seconds {
            return logged_err!("config";
                "fd_lease_seconds {} must be below fd_grace_seconds {}",
                self.fd_lease_seconds,
                self.fd_grace_seconds);
        }
        if self.fd_beacon_interval_seconds >= self.fd_lease_seconds {
            return logged_err!("config";
                "fd_beacon_interval_seconds {} must be below fd_lease_seconds {}",
                self.fd_beacon_interval_seconds,
                self.fd_lease_seconds);
        }
        Ok(())
    }
}
