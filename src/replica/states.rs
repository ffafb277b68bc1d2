//! Per-role bookkeeping attached to a replica: the primary's group view and
//! write pipeline, the secondary's checkpoint flag, and the potential
//! secondary's learning context.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::base::{
    Decree, Gpid, LearnSignature, LearnerStatus, NodeAddr,
    PartitionConfiguration, PartitionStatus, ReplicaConfiguration,
};
use crate::messages::ConfigProposalRequest;
use crate::replica::Mutation;

use tokio::time::Instant;

/// What the primary remembers about one learner.
#[derive(Debug, Clone)]
pub struct RemoteLearnerState {
    pub signature: LearnSignature,
    /// Pinned on the first cache-covered learn round and reused afterwards
    /// so prepares sent to this learner stay acceptable.
    pub prepare_start_decree: Option<Decree>,
}

/// 2PC progress of one in-flight mutation on the primary.
pub struct MutationProgress {
    pub mutation: Arc<Mutation>,
    /// Secondaries that acknowledged the prepare.
    pub acked: HashSet<NodeAddr>,
    /// Local shared-log append has completed successfully.
    pub log_done: bool,
}

/// State owned only while this replica is primary.
pub struct PrimaryStates {
    /// Authoritative group view as last confirmed by the meta-server.
    pub membership: PartitionConfiguration,
    pub statuses: HashMap<NodeAddr, PartitionStatus>,
    pub learners: HashMap<NodeAddr, RemoteLearnerState>,
    /// In-flight 2PC bookkeeping by decree.
    pub progress: BTreeMap<Decree, MutationProgress>,
    /// The reconfiguration round-trip currently outstanding, if any. At most
    /// one at a time; new proposals are dropped while this is set.
    pub reconfiguration_request: Option<ConfigProposalRequest>,
    pub last_prepare_decree_on_new_primary: Decree,
}

impl PrimaryStates {
    pub fn new(gpid: Gpid, app_type: String) -> Self {
        PrimaryStates {
            membership: PartitionConfiguration {
                gpid,
                ballot: 0,
                max_replica_count: 0,
                primary: None,
                secondaries: Vec::new(),
                last_committed_decree: 0,
                app_type,
            },
            statuses: HashMap::new(),
            learners: HashMap::new(),
            progress: BTreeMap::new(),
            reconfiguration_request: None,
            last_prepare_decree_on_new_primary: 0,
        }
    }

    /// Adopts a fresh authoritative membership; optionally forgets learner
    /// progress (required when primaryship moved).
    pub fn reset_membership(
        &mut self,
        config: &PartitionConfiguration,
        clear_learners: bool,
    ) {
        self.membership = config.clone();
        self.statuses.clear();
        if let Some(primary) = config.primary {
            self.statuses.insert(primary, PartitionStatus::Primary);
        }
        for node in &config.secondaries {
            self.statuses.insert(*node, PartitionStatus::Secondary);
        }
        if clear_learners {
            self.learners.clear();
        } else {
            // learners that made it into the membership are done learning
            self.learners.retain(|node, _| {
                Some(*node) != config.primary
                    && !config.secondaries.contains(node)
            });
            for node in self.learners.keys() {
                self.statuses
                    .insert(*node, PartitionStatus::PotentialSecondary);
            }
        }
    }

    /// Builds the replica configuration the primary hands out for a group
    /// member in the given role.
    pub fn get_replica_config(
        &self,
        status: PartitionStatus,
        learner_signature: Option<LearnSignature>,
    ) -> ReplicaConfiguration {
        ReplicaConfiguration {
            gpid: self.membership.gpid,
            ballot: self.membership.ballot,
            primary: self.membership.primary,
            status,
            learner_signature,
        }
    }

    pub fn get_node_status(&self, node: NodeAddr) -> PartitionStatus {
        self.statuses
            .get(&node)
            .copied()
            .unwrap_or(PartitionStatus::Inactive)
    }

    pub fn check_exist(&self, node: NodeAddr, status: PartitionStatus) -> bool {
        self.get_node_status(node) == status
    }

    /// Drops pipeline and reconfiguration state; `clear_learners` also
    /// forgets learner epochs.
    pub fn cleanup(&mut self, clear_learners: bool) {
        self.progress.clear();
        self.reconfiguration_request = None;
        if clear_learners {
            self.learners.clear();
            self.statuses.clear();
        }
    }
}

/// State owned only while this replica is secondary.
#[derive(Default)]
pub struct SecondaryStates {
    pub checkpoint_is_running: bool,
}

impl SecondaryStates {
    /// True when it is safe to leave the secondary role.
    pub fn cleanup(&mut self, force: bool) -> bool {
        if self.checkpoint_is_running && !force {
            return false;
        }
        self.checkpoint_is_running = false;
        true
    }
}

/// State owned only while this replica is a potential secondary (learner).
pub struct PotentialSecondaryStates {
    pub learning_signature: Option<LearnSignature>,
    pub learning_status: LearnerStatus,
    /// At most one learning round runs at a time.
    pub learning_round_is_running: bool,
    pub learning_start_prepare_decree: Option<Decree>,
    pub learning_start: Option<Instant>,
}

impl Default for PotentialSecondaryStates {
    fn default() -> Self {
        PotentialSecondaryStates {
            learning_signature: None,
            learning_status: LearnerStatus::WithoutPrepare,
            learning_round_is_running: false,
            learning_start_prepare_decree: None,
            learning_start: None,
        }
    }
}

impl PotentialSecondaryStates {
    pub fn duration_ms(&self) -> u64 {
        self.learning_start
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Cancels pending learning work and resets the context. A stale learn
    /// reply or retry firing later is dropped by its signature check.
    pub fn cleanup(&mut self, _force: bool) -> bool {
        self.learning_round_is_running = false;
        self.learning_signature = None;
        self.learning_status = LearnerStatus::WithoutPrepare;
        self.learning_start_prepare_decree = None;
        self.learning_start = None;
        true
    }
}
