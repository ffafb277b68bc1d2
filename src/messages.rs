//! Typed peer-to-peer and replica-to-meta message definitions. Each variant
//! of [`ReplicaMsg`] corresponds to one logical RPC code; the transport
//! envelope itself is owned by the hosting process.

use crate::base::{
    Ballot, ConfigType, Decree, ErrCode, Gpid, LearnSignature, LearnerStatus,
    NodeAddr, PartitionConfiguration, PartitionStatus, ReplicaConfiguration,
};
use crate::replica::Mutation;

use serde::{Deserialize, Serialize};

/// Prepare request: primary pushing one mutation to a group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub gpid: Gpid,
    /// The receiver's intended view (its status in the group plus ballot).
    pub config: ReplicaConfiguration,
    pub mutation: Mutation,
}

/// Prepare acknowledgement from a group member back to the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub gpid: Gpid,
    pub node: NodeAddr,
    pub err: ErrCode,
    pub ballot: Ballot,
    pub decree: Decree,
    pub last_committed_decree_in_app: Decree,
    pub last_committed_decree_in_prepare_list: Decree,
}

/// Periodic primary -> member liveness and configuration sync. Doubles as
/// the one-way add-learner trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCheckRequest {
    pub app_type: String,
    pub node: NodeAddr,
    pub config: ReplicaConfiguration,
    pub last_committed_decree: Decree,
}

/// Group-check reply; also reused one-way as the learner completion notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCheckResponse {
    pub gpid: Gpid,
    pub node: NodeAddr,
    pub err: ErrCode,
    pub last_committed_decree_in_app: Decree,
    pub last_committed_decree_in_prepare_list: Decree,
    pub learner_status: LearnerStatus,
    pub learner_signature: Option<LearnSignature>,
}

/// Which form of state a learn response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearnType {
    Cache,
    App,
    Log,
}

/// A transferable bundle of learner state: either inline meta blobs, file
/// paths relative to the sender's base dir, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnState {
    pub from_decree_excluded: Decree,
    pub to_decree_included: Decree,
    pub meta: Vec<Vec<u8>>,
    pub files: Vec<String>,
}

/// Learner -> primary catch-up request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnRequest {
    pub gpid: Gpid,
    pub learner: NodeAddr,
    pub signature: LearnSignature,
    pub last_committed_decree_in_app: Decree,
    pub last_committed_decree_in_prepare_list: Decree,
    pub app_specific_learn_request: Vec<u8>,
}

/// Primary -> learner catch-up response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnResponse {
    pub err: ErrCode,
    pub config: ReplicaConfiguration,
    pub last_committed_decree: Decree,
    /// First decree the learner will receive via live prepares; `None` while
    /// the to-be-learned state is not yet covered by the prepare window.
    pub prepare_start_decree: Option<Decree>,
    pub learn_type: LearnType,
    pub state: LearnState,
    pub base_local_dir: String,
}

/// Configuration change proposal. Flows meta -> primary as a proposal and
/// primary -> meta as the update request (with the ballot pre-incremented).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigProposalRequest {
    pub kind: ConfigType,
    pub node: NodeAddr,
    pub config: PartitionConfiguration,
}

/// Meta-server reply to an update-configuration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdateResponse {
    pub err: ErrCode,
    pub config: PartitionConfiguration,
}

/// Per-replica progress summary carried in node reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLoadInfo {
    pub gpid: Gpid,
    pub status: PartitionStatus,
    pub ballot: Ballot,
    pub last_committed_decree: Decree,
    pub last_durable_decree: Decree,
}

/// Replica server -> meta: node-wide load heartbeat feeding the balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: NodeAddr,
    pub replicas: Vec<ReplicaLoadInfo>,
}

/// Lease heartbeat from a replica server to the meta leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub from_addr: NodeAddr,
    pub to_addr: NodeAddr,
    pub time_ms: u64,
}

/// Beacon acknowledgement from a meta server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconAck {
    pub time_ms: u64,
    pub this_node: NodeAddr,
    pub primary_node: Option<NodeAddr>,
    pub is_master: bool,
    pub allowed: bool,
}

/// The full inter-process message set, one variant per logical RPC code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMsg {
    Prepare(PrepareRequest),
    PrepareAck(PrepareResponse),
    GroupCheck(GroupCheckRequest),
    GroupCheckAck(GroupCheckResponse),
    Learn(LearnRequest),
    LearnReply(LearnResponse),
    AddLearner(GroupCheckRequest),
    LearnCompletionNotify(GroupCheckResponse),
    RemoveReplica(ReplicaConfiguration),
    ConfigProposal(ConfigProposalRequest),
    UpdateConfiguration(ConfigProposalRequest),
    UpdateConfigurationReply(ConfigUpdateResponse),
    ConfigSync(PartitionConfiguration),
    QueryConfigurationByNode { node: NodeAddr },
    QueryDecree { gpid: Gpid },
    QueryDecreeReply { gpid: Gpid, last_committed_decree: Decree },
    NodeReport(NodeReport),
    Beacon(Beacon),
    BeaconAck(BeaconAck),
}

impl ReplicaMsg {
    /// The partition a message should be routed to, if it is replica-scoped.
    pub fn gpid(&self) -> Option<Gpid> {
        match self {
            ReplicaMsg::Prepare(req) => Some(req.gpid),
            ReplicaMsg::PrepareAck(resp) => Some(resp.gpid),
            ReplicaMsg::GroupCheck(req) => Some(req.config.gpid),
            ReplicaMsg::GroupCheckAck(resp) => Some(resp.gpid),
            ReplicaMsg::Learn(req) => Some(req.gpid),
            ReplicaMsg::LearnReply(resp) => Some(resp.config.gpid),
            ReplicaMsg::AddLearner(req) => Some(req.config.gpid),
            ReplicaMsg::LearnCompletionNotify(resp) => Some(resp.gpid),
            ReplicaMsg::RemoveReplica(config) => Some(config.gpid),
            ReplicaMsg::ConfigProposal(req) => Some(req.config.gpid),
            ReplicaMsg::UpdateConfiguration(req) => Some(req.config.gpid),
            ReplicaMsg::UpdateConfigurationReply(resp) => {
                Some(resp.config.gpid)
            }
            ReplicaMsg::ConfigSync(config) => Some(config.gpid),
            ReplicaMsg::QueryDecree { gpid } => Some(*gpid),
            ReplicaMsg::QueryDecreeReply { gpid, .. } => Some(*gpid),
            ReplicaMsg::QueryConfigurationByNode { .. }
            | ReplicaMsg::NodeReport(..)
            | ReplicaMsg::Beacon(..)
            | ReplicaMsg::BeaconAck(..) => None,
        }
    }
}
