//! Ballot/role state machine and the reconfiguration protocol against the
//! meta-server.

use super::*;

use crate::base::{remove_node, ConfigType};
use crate::messages::{ConfigProposalRequest, ConfigUpdateResponse};

use rand::Rng;

impl Replica {
    /// Meta-server (or relayed) proposal handler; runs on the primary.
    pub fn on_config_proposal(&mut self, mut proposal: ConfigProposalRequest) {
        pf_debug!(self.name();
            "on_config_proposal {} for {}", proposal.kind, proposal.node);

        if proposal.config.ballot < self.ballot() {
            pf_warn!(self.name();
                "out-dated proposal at ballot {} (local {})",
                proposal.config.ballot, self.ballot());
            return;
        }
        if self.primary_states.reconfiguration_request.is_some() {
            pf_debug!(self.name();
                "reconfiguration on the way, skip incoming proposal");
            return;
        }
        if proposal.config.ballot > self.ballot() {
            let adopted = proposal.config.clone();
            if !self.update_configuration(&adopted) {
                return;
            }
        }

        match proposal.kind {
            ConfigType::AssignPrimary | ConfigType::UpgradeToPrimary => {
                self.assign_primary(proposal)
            }
            ConfigType::AddSecondary => self.add_potential_secondary(proposal),
            ConfigType::DowngradeToSecondary => {
                self.downgrade_to_secondary_on_primary(proposal)
            }
            ConfigType::DowngradeToInactive => {
                self.downgrade_to_inactive_on_primary(proposal)
            }
            ConfigType::Remove => self.remove(proposal),
            ConfigType::UpgradeToSecondary => {
                pf_warn!(self.name();
                    "unexpected UpgradeToSecondary proposal dropped");
            }
        }
    }

    fn assign_primary(&mut self, mut proposal: ConfigProposalRequest) {
        if proposal.node != self.me() {
            pf_warn!(self.name();
                "assign primary proposal targets {} instead of us",
                proposal.node);
            return;
        }
        if self.status() == PartitionStatus::Primary {
            pf_warn!(self.name();
                "invalid assign primary proposal while already primary");
            return;
        }
        if proposal.kind == ConfigType::UpgradeToPrimary
            && (self.status() != PartitionStatus::Secondary
                || self.secondary_states.checkpoint_is_running)
        {
            pf_warn!(self.name();
                "invalid upgrade to primary proposal while {} or checkpointing",
                self.status());
            return;
        }

        proposal.config.primary = Some(self.me());
        remove_node(self.me(), &mut proposal.config.secondaries);
        self.update_configuration_on_meta_server(
            proposal.kind,
            proposal.node,
            proposal.config,
        );
    }

    /// Primary: start a learner on the candidate node. Sends the one-way
    /// add-learner trigger; the actual state transfer is learner-driven.
    fn add_potential_secondary(&mut self, proposal: ConfigProposalRequest) {
        if self.status() != PartitionStatus::Primary {
            pf_warn!(self.name();
                "ignore add secondary proposal in status {}", self.status());
            return;
        }
        if proposal.config.ballot != self.ballot() {
            pf_warn!(self.name();
                "add secondary proposal at mismatched ballot {}",
                proposal.config.ballot);
            return;
        }
        let node = proposal.node;
        if self
            .primary_states
            .check_exist(node, PartitionStatus::Primary)
            || self
                .primary_states
                .check_exist(node, PartitionStatus::Secondary)
        {
            pf_warn!(self.name();
                "add secondary proposal for existing member {}", node);
            return;
        }

        let signature = match self.primary_states.learners.get(&node) {
            Some(learner) => learner.signature,
            None => {
                let mut signature: u64 = rand::thread_rng().gen();
                while signature == 0 {
                    signature = rand::thread_rng().gen();
                }
                self.primary_states.learners.insert(
                    node,
                    RemoteLearnerState {
                        signature,
                        prepare_start_decree: None,
                    },
                );
                self.primary_states
                    .statuses
                    .insert(node, PartitionStatus::PotentialSecondary);
                signature
            }
        };

        let request = crate::messages::GroupCheckRequest {
            app_type: self.app_type().to_string(),
            node,
            config: self.primary_states.get_replica_config(
                PartitionStatus::PotentialSecondary,
                Some(signature),
            ),
            last_committed_decree: self.last_committed_decree(),
        };

        pf_debug!(self.name(); "asking {} to start learning", node);
        self.send_to(node, ReplicaMsg::AddLearner(request));
    }

    /// Primary: a learner finished; promote it to secondary via the
    /// meta-server.
    pub(crate) fn upgrade_to_secondary_on_primary(&mut self, node: NodeAddr) {
        pf_info!(self.name();
            "upgrade potential secondary {} to secondary", node);

        let mut config = self.primary_states.membership.clone();
        config.secondaries.push(node);
        self.update_configuration_on_meta_server(
            ConfigType::UpgradeToSecondary,
            node,
            config,
        );
    }

    fn downgrade_to_secondary_on_primary(
        &mut self,
        mut proposal: ConfigProposalRequest,
    ) {
        if proposal.config.ballot != self.ballot()
            || self.status() != PartitionStatus::Primary
        {
            return;
        }
        debug_assert_eq!(proposal.node, self.me());

        proposal.config.primary = None;
        proposal.config.secondaries.push(proposal.node);
        self.update_configuration_on_meta_server(
            ConfigType::DowngradeToSecondary,
            proposal.node,
            proposal.config,
        );
    }

    fn downgrade_to_inactive_on_primary(
        &mut self,
        mut proposal: ConfigProposalRequest,
    ) {
        if proposal.config.ballot != self.ballot()
            || self.status() != PartitionStatus::Primary
        {
            return;
        }

        if Some(proposal.node) == proposal.config.primary {
            proposal.config.primary = None;
        } else if !remove_node(proposal.node, &mut proposal.config.secondaries)
        {
            pf_warn!(self.name();
                "downgrade to inactive for non-member {}", proposal.node);
            return;
        }
        self.update_configuration_on_meta_server(
            ConfigType::DowngradeToInactive,
            proposal.node,
            proposal.config,
        );
    }

    fn remove(&mut self, mut proposal: ConfigProposalRequest) {
        if proposal.config.ballot != self.ballot()
            || self.status() != PartitionStatus::Primary
        {
            return;
        }

        match self.primary_states.get_node_status(proposal.node) {
            PartitionStatus::Primary => {
                proposal.config.primary = None;
            }
            PartitionStatus::Secondary => {
                remove_node(proposal.node, &mut proposal.config.secondaries);
            }
            PartitionStatus::PotentialSecondary => {}
            _ => {}
        }
        self.update_configuration_on_meta_server(
            ConfigType::Remove,
            proposal.node,
            proposal.config,
        );
    }

    /// One-way removal notice from the primary.
    pub fn on_remove(&mut self, request: ReplicaConfiguration) {
        if request.ballot < self.ballot() {
            return;
        }

        // A remove request delayed by the network can arrive after this node
        // was re-added as a learner under the same ballot. The add happened
        // first; the stale removal is dropped.
        if request.ballot == self.ballot()
            && self.status() == PartitionStatus::PotentialSecondary
        {
            pf_warn!(self.name();
                "ignoring same-ballot remove request while learning");
            return;
        }

        debug_assert_eq!(request.status, PartitionStatus::Inactive);
        let same_ballot = request.ballot == self.ballot();
        self.update_local_configuration(request, same_ballot);
    }

    /// Sends the proposed configuration (ballot + 1) to the meta-server and
    /// disables 2PC for the duration of the round-trip.
    pub(crate) fn update_configuration_on_meta_server(
        &mut self,
        kind: ConfigType,
        node: NodeAddr,
        mut config: PartitionConfiguration,
    ) {
        config.last_committed_decree = self.last_committed_decree();

        if kind != ConfigType::AssignPrimary
            && kind != ConfigType::UpgradeToPrimary
            && self.status() != PartitionStatus::Primary
        {
            pf_warn!(self.name();
                "reconfiguration {} attempted while {}", kind, self.status());
            return;
        }

        // disable 2pc during all reconfiguration types for simplicity, at
        // the cost of some write availability
        self.update_local_configuration_with_no_ballot_change(
            PartitionStatus::Inactive,
        );
        self.set_inactive_state_transient(true);

        let mut request = ConfigProposalRequest { kind, node, config };
        request.config.ballot += 1;

        self.primary_states.reconfiguration_request = Some(request.clone());
        pf_debug!(self.name();
            "sending {} for {} at ballot {}",
            kind, node, request.config.ballot);
        self.send_meta(ReplicaMsg::UpdateConfiguration(request));
        self.arm_reconfiguration_retry();
    }

    fn arm_reconfiguration_retry(&self) {
        if let Err(e) =
            self.reconfiguration_retry_timer.kickoff(Duration::from_secs(1))
        {
            pf_warn!(self.name();
                "failed to arm reconfiguration retry timer: {}", e);
        }
    }

    /// Resends the outstanding reconfiguration request, if still relevant.
    pub(crate) fn retry_update_configuration_on_meta_server(&mut self) {
        let Some(request) =
            self.primary_states.reconfiguration_request.clone()
        else {
            return;
        };
        if self.status() != PartitionStatus::Inactive
            || !self.inactive_is_transient
        {
            return;
        }
        pf_debug!(self.name();
            "retrying reconfiguration {} at ballot {}",
            request.kind, request.config.ballot);
        self.send_meta(ReplicaMsg::UpdateConfiguration(request));
        self.arm_reconfiguration_retry();
    }

    /// Meta-server reply to our configuration update.
    pub fn on_update_configuration_reply(
        &mut self,
        resp: ConfigUpdateResponse,
    ) {
        if self.status() != PartitionStatus::Inactive {
            self.primary_states.reconfiguration_request = None;
            return;
        }
        let Some(request) =
            self.primary_states.reconfiguration_request.clone()
        else {
            return;
        };
        if let Err(e) = self.reconfiguration_retry_timer.cancel() {
            pf_warn!(self.name();
                "failed to disarm reconfiguration retry timer: {}", e);
        }

        pf_debug!(self.name();
            "update configuration reply err {} ballot {} (local {})",
            resp.err, resp.config.ballot, self.ballot());

        if !resp.err.is_ok() && resp.err != ErrCode::InvalidVersion {
            self.send_meta(ReplicaMsg::UpdateConfiguration(request));
            self.arm_reconfiguration_retry();
            return;
        }

        if resp.config.ballot < self.ballot() {
            self.primary_states.reconfiguration_request = None;
            return;
        }

        if resp.err.is_ok() {
            match request.kind {
                ConfigType::UpgradeToPrimary => {
                    self.primary_states.last_prepare_decree_on_new_primary =
                        self.prepare_list.max_decree();
                }
                ConfigType::AssignPrimary => {
                    self.primary_states.last_prepare_decree_on_new_primary = 0;
                }
                ConfigType::Remove => {
                    if request.node != self.me() {
                        let mut rconfig =
                            resp.config.replica_config_for(request.node);
                        rconfig.status = PartitionStatus::Inactive;
                        self.send_to(
                            request.node,
                            ReplicaMsg::RemoveReplica(rconfig),
                        );
                    }
                }
                _ => {}
            }
        }

        self.update_configuration(&resp.config);
        self.primary_states.reconfiguration_request = None;
    }

    /// Adopts an authoritative partition configuration.
    pub fn update_configuration(
        &mut self,
        config: &PartitionConfiguration,
    ) -> bool {
        debug_assert!(config.ballot >= self.ballot());

        let rconfig = config.replica_config_for(self.me());

        if rconfig.status == PartitionStatus::Primary
            && (config.ballot > self.ballot()
                || self.status() != PartitionStatus::Primary)
        {
            self.primary_states
                .reset_membership(config, config.primary != Some(self.me()));
        }

        if config.ballot > self.ballot()
            || self.is_same_ballot_status_change_allowed(
                self.status(),
                rconfig.status,
            )
        {
            self.update_local_configuration(rconfig, true)
        } else {
            false
        }
    }

    /// The only same-ballot role transitions that are legal.
    pub(crate) fn is_same_ballot_status_change_allowed(
        &self,
        old: PartitionStatus,
        new: PartitionStatus,
    ) -> bool {
        use PartitionStatus::*;
        matches!(
            (old, new),
            (Inactive, PotentialSecondary) | (PotentialSecondary, Secondary)
        ) || (old == Inactive
            && matches!(new, Secondary | Primary)
            && self.inactive_is_transient)
            || old == new
    }

    /// Low-level role/ballot switch with the full transition matrix. Returns
    /// false when the change is rejected or leads into close.
    pub fn update_local_configuration(
        &mut self,
        config: ReplicaConfiguration,
        same_ballot: bool,
    ) -> bool {
        use PartitionStatus::*;

        if !(config.ballot > self.ballot()
            || (same_ballot && config.ballot == self.ballot()))
        {
            pf_warn!(self.name();
                "rejecting configuration at ballot {} (local {})",
                config.ballot, self.ballot());
            return false;
        }
        debug_assert_eq!(config.gpid, self.gpid());

        let old_status = self.status();
        let old_ballot = self.ballot();

        // skip unnecessary changes
        if old_status == config.status && old_ballot == config.ballot {
            return true;
        }

        // guards that may veto the transition; errors are always let through
        match old_status {
            Error => {
                pf_debug!(self.name();
                    "status change {} @ {} => {} @ {} not allowed",
                    old_status, old_ballot, config.status, config.ballot);
                return false;
            }
            Inactive => {
                if matches!(config.status, Primary | Secondary)
                    && !self.inactive_is_transient
                {
                    pf_debug!(self.name();
                        "status change {} @ {} => {} @ {} not allowed \
                         when inactive state is not transient",
                        old_status, old_ballot, config.status, config.ballot);
                    return false;
                }
            }
            PotentialSecondary => {
                if config.status == Inactive
                    && !self.potential_secondary_states.cleanup(false)
                {
                    pf_warn!(self.name();
                        "status change to {} blocked by running learn task",
                        config.status);
                    return false;
                }
            }
            Secondary => {
                if !matches!(config.status, Secondary | Error)
                    && !self.secondary_states.cleanup(false)
                {
                    pf_warn!(self.name();
                        "status change to {} blocked by running checkpoint",
                        config.status);
                    return false;
                }
            }
            _ => {}
        }

        self.config = config;

        match (old_status, self.status()) {
            (Primary, Primary) => {
                self.pending_prepare_acks.clear();
                self.replay_prepare_list();
            }
            (Primary, Inactive) => {
                self.pending_prepare_acks.clear();
                self.clear_prepare_ack_timers();
                self.primary_states.cleanup(old_ballot != self.ballot());
            }
            (Primary, Secondary) | (Primary, Error) => {
                self.pending_prepare_acks.clear();
                self.clear_prepare_ack_timers();
                self.primary_states.cleanup(true);
            }
            (Secondary, Primary) => {
                self.pending_prepare_acks.clear();
                self.replay_prepare_list();
            }
            (Secondary, PotentialSecondary) => {
                // no further 2pc until an explicit learn round
                self.pending_prepare_acks.clear();
                self.potential_secondary_states.learning_status =
                    crate::base::LearnerStatus::WithoutPrepare;
            }
            (Secondary, _) => {
                self.pending_prepare_acks.clear();
            }
            (PotentialSecondary, Secondary) => {
                let durable_point = self.app.last_committed_decree();
                self.prepare_list.truncate(durable_point);
                self.potential_secondary_states.cleanup(true);
            }
            (PotentialSecondary, Error) => {
                self.prepare_list
                    .reset(self.app.last_committed_decree());
                self.potential_secondary_states.cleanup(false);
            }
            (PotentialSecondary, _) => {}
            (Inactive, Primary) => {
                self.inactive_is_transient = false;
                self.replay_prepare_list();
            }
            (Inactive, Secondary) | (Inactive, PotentialSecondary) => {
                self.inactive_is_transient = false;
            }
            (Inactive, Error) => {
                if self.inactive_is_transient {
                    self.primary_states.cleanup(true);
                }
                self.inactive_is_transient = false;
            }
            (Inactive, Inactive) => {}
            (Primary, PotentialSecondary) | (Error, _) => {
                debug_assert!(false, "invalid execution path");
            }
        }

        pf_info!(self.name();
            "status change {} @ {} => {} @ {}, pre({}, {}), app({}, {})",
            old_status, old_ballot, self.status(), self.ballot(),
            self.prepare_list.max_decree(),
            self.prepare_list.last_committed_decree(),
            self.app.last_committed_decree(),
            self.app.last_durable_decree());

        self.publish_runtime_info();
        if self.status() != old_status {
            let is_closing = self.status() == PartitionStatus::Error
                || (self.status() == PartitionStatus::Inactive
                    && self.ballot() > old_ballot);
            self.notify_stub(StubNotice::StateUpdate {
                config: self.config.clone(),
                is_closing,
            });
            if is_closing {
                pf_info!(self.name(); "being closed after status change");
                return false;
            }
        } else {
            self.notify_stub(StubNotice::StateUpdate {
                config: self.config.clone(),
                is_closing: false,
            });
        }

        true
    }

    /// Role change that keeps the current ballot.
    pub fn update_local_configuration_with_no_ballot_change(
        &mut self,
        status: PartitionStatus,
    ) -> bool {
        if self.status() == status {
            return false;
        }
        let mut config = self.config.clone();
        config.status = status;
        self.update_local_configuration(config, true)
    }

    /// Periodic authoritative configuration broadcast from the meta-server.
    pub fn on_config_sync(&mut self, config: PartitionConfiguration) {
        pf_debug!(self.name(); "configuration sync at ballot {}", config.ballot);

        if config.ballot < self.ballot() {
            return;
        }
        if self.status() == PartitionStatus::Primary
            || self.primary_states.reconfiguration_request.is_some()
        {
            // the primary holds the truth already
            return;
        }

        self.update_configuration(&config);

        if self.status() == PartitionStatus::Inactive
            && !self.inactive_is_transient
        {
            // dropped from the group with the primary dead or pointing at
            // us: ask the meta-server to forget this replica, then close
            if config.primary == Some(self.me()) || config.primary.is_none() {
                self.notify_stub(StubNotice::RemoveReplicaOnMeta(config));
            }
        }
    }

    /// Re-prepares the window under the current ballot after a promotion,
    /// emitting empty writes for holes.
    pub(crate) fn replay_prepare_list(&mut self) {
        let start = self.last_committed_decree() + 1;
        let end = self.prepare_list.max_decree();
        pf_info!(self.name();
            "replay prepare list from {} to {} at ballot {}",
            start, end, self.ballot());

        for decree in start..=end {
            let header = MutationHeader {
                gpid: self.gpid(),
                ballot: self.ballot(),
                decree,
                log_offset: 0,
                last_committed_decree: self.last_committed_decree(),
                timestamp_ms: 0,
                client_request_id: 0,
            };
            let mu = match self.prepare_list.get(decree) {
                Some(old) => Arc::new(Mutation {
                    header: MutationHeader {
                        client_request_id: old.header.client_request_id,
                        timestamp_ms: old.header.timestamp_ms,
                        ..header
                    },
                    updates: old.updates.clone(),
                    rpc_code: old.rpc_code,
                }),
                None => {
                    pf_info!(self.name();
                        "emit empty mutation for hole at decree {}", decree);
                    Arc::new(Mutation::new_empty(header))
                }
            };
            self.init_prepare(mu);
        }
    }
}
