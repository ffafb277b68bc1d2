//! Two-phase-commit pipeline: the primary's prepare/commit path, the
//! member-side prepare handler, and the periodic group check.

use super::*;

use crate::messages::{
    GroupCheckRequest, GroupCheckResponse, PrepareRequest, PrepareResponse,
};

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::replica::states::MutationProgress;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Replica {
    /// Entry point for a client write landing on this replica. Returns the
    /// acceptance verdict; the commit itself completes asynchronously.
    pub fn on_client_write(
        &mut self,
        payload: Vec<u8>,
        rpc_code: u32,
        client_request_id: u64,
    ) -> ErrCode {
        match self.status() {
            PartitionStatus::Primary => {}
            PartitionStatus::Inactive if self.inactive_is_transient => {
                return ErrCode::InactiveState;
            }
            _ => return ErrCode::InvalidState,
        }

        // bound how far prepares may run ahead of commit
        if self.max_prepared_decree() - self.last_committed_decree()
            >= self.options.staleness_for_commit
        {
            pf_warn!(self.name();
                "write rejected: prepare window at staleness bound {}",
                self.options.staleness_for_commit);
            return ErrCode::Timeout;
        }

        let decree = self.max_prepared_decree() + 1;
        let mu = Arc::new(Mutation::new(
            MutationHeader {
                gpid: self.gpid(),
                ballot: self.ballot(),
                decree,
                log_offset: 0,
                last_committed_decree: self.last_committed_decree(),
                timestamp_ms: now_ms(),
                client_request_id,
            },
            rpc_code,
            payload,
        ));
        self.init_prepare(mu);
        ErrCode::Ok
    }

    /// Drives one mutation through the group: into the prepare list, out to
    /// every secondary (and prepare-eligible learner), and into the logs.
    pub(crate) fn init_prepare(&mut self, mu: Arc<Mutation>) {
        let decree = mu.header.decree;
        pf_debug!(self.name(); "init_prepare mutation {}", mu.name());

        if let Err(code) = self
            .prepare_list
            .prepare(mu.clone(), PartitionStatus::Primary)
        {
            pf_error!(self.name();
                "prepare list refused mutation {}: {}", mu.name(), code);
            return;
        }

        self.primary_states.progress.insert(
            decree,
            MutationProgress {
                mutation: mu.clone(),
                acked: HashSet::new(),
                log_done: false,
            },
        );

        // remote prepares first, then the local appends
        let secondaries = self.primary_states.membership.secondaries.clone();
        for node in secondaries {
            self.send_prepare(node, PartitionStatus::Secondary, &mu);
        }
        let eligible_learners: Vec<NodeAddr> = self
            .primary_states
            .learners
            .iter()
            .filter(|(_, l)| {
                l.prepare_start_decree
                    .map(|start| decree >= start)
                    .unwrap_or(false)
            })
            .map(|(node, _)| *node)
            .collect();
        for node in eligible_learners {
            self.send_prepare(node, PartitionStatus::PotentialSecondary, &mu);
        }

        match self.shared_log.append(&mu) {
            Ok(ack) => self.track_log_ack(LogAckKind::Shared, decree, ack),
            Err(e) => {
                pf_error!(self.name(); "shared log append failed: {}", e);
                self.handle_local_failure(ErrCode::LogIoFailure);
                return;
            }
        }
        if let Some(private_log) = &self.private_log {
            // private appends on the primary do not gate the commit
            if let Err(e) = private_log.append(&mu) {
                pf_error!(self.name(); "private log append failed: {}", e);
                self.handle_local_failure(ErrCode::LogIoFailure);
            }
        }

        self.try_commit_primary();
    }

    fn send_prepare(
        &mut self,
        node: NodeAddr,
        status: PartitionStatus,
        mu: &Arc<Mutation>,
    ) {
        let signature = self
            .primary_states
            .learners
            .get(&node)
            .map(|l| l.signature);
        let req = PrepareRequest {
            gpid: self.gpid(),
            config: self.primary_states.get_replica_config(status, signature),
            mutation: (**mu).clone(),
        };
        self.send_to(node, ReplicaMsg::Prepare(req));
        self.arm_prepare_ack_timer(node);
    }

    fn prepare_ack_timeout(&self, node: NodeAddr) -> Duration {
        let timeout_ms = if self.primary_states.learners.contains_key(&node) {
            self.options.prepare_timeout_ms_for_potential_secondaries
        } else {
            self.options.prepare_timeout_ms_for_secondaries
        };
        Duration::from_millis(timeout_ms)
    }

    /// True if `node` is expected to ack the prepare at `decree`: every
    /// decree for secondaries, decrees from the pinned prepare start for
    /// learners.
    fn expects_ack(&self, node: NodeAddr, decree: Decree) -> bool {
        match self.primary_states.learners.get(&node) {
            Some(learner) => learner
                .prepare_start_decree
                .map(|start| decree >= start)
                .unwrap_or(false),
            None => self
                .primary_states
                .membership
                .secondaries
                .contains(&node),
        }
    }

    fn has_unacked_prepares(&self, node: NodeAddr) -> bool {
        self.primary_states
            .progress
            .iter()
            .any(|(decree, progress)| {
                self.expects_ack(node, *decree)
                    && !progress.acked.contains(&node)
            })
    }

    /// (Re-)arms `node`'s ack watchdog; it fires once the node has gone a
    /// full timeout window without acking anything.
    fn arm_prepare_ack_timer(&mut self, node: NodeAddr) {
        let timeout = self.prepare_ack_timeout(node);
        let tx_self = self.tx_self();
        let timer =
            self.prepare_ack_timers.entry(node).or_insert_with(|| {
                Timer::new(Some(move || {
                    let _ = tx_self
                        .send(ReplicaEvent::PrepareTimeout { node });
                }))
            });
        if let Err(e) = timer.kickoff(timeout) {
            pf_warn!(self.name();
                "failed to arm prepare ack timer for {}: {}", node, e);
        }
    }

    /// Called on every ack from `node`: extend the watchdog while work is
    /// still outstanding, disarm it otherwise.
    fn refresh_prepare_ack_timer(&mut self, node: NodeAddr) {
        if self.has_unacked_prepares(node) {
            self.arm_prepare_ack_timer(node);
        } else if let Some(timer) = self.prepare_ack_timers.get(&node) {
            if let Err(e) = timer.cancel() {
                pf_warn!(self.name();
                    "failed to disarm prepare ack timer for {}: {}", node, e);
            }
        }
    }

    /// Member-side prepare handler.
    pub fn on_prepare(
        &mut self,
        from: NodeAddr,
        req: PrepareRequest,
    ) -> Result<(), ReplicoreError> {
        let decree = req.mutation.header.decree;
        let req_ballot = req.config.ballot;

        if req_ballot < self.ballot() {
            pf_warn!(self.name();
                "stale prepare for decree {} at ballot {} (local {})",
                decree, req_ballot, self.ballot());
            self.reply_prepare_ack(from, ErrCode::StaleBallot, decree);
            return Ok(());
        }
        if req_ballot > self.ballot()
            && !self.update_local_configuration(req.config.clone(), false)
        {
            self.reply_prepare_ack(from, ErrCode::InvalidState, decree);
            return Ok(());
        }

        match self.status() {
            PartitionStatus::Secondary => {}
            PartitionStatus::PotentialSecondary => {
                use crate::base::LearnerStatus::*;
                let ls = self.potential_secondary_states.learning_status;
                if !matches!(ls, WithPrepareTransient | WithPrepare | Succeeded)
                {
                    // not ready to accept prepares yet; the learner protocol
                    // will catch this range up instead
                    pf_debug!(self.name();
                        "ignoring prepare for decree {} while {}", decree, ls);
                    return Ok(());
                }
            }
            _ => {
                self.reply_prepare_ack(from, ErrCode::InvalidState, decree);
                return Ok(());
            }
        }

        let piggyback = req.mutation.header.last_committed_decree;
        let mu = Arc::new(req.mutation);
        if let Err(code) = self.prepare_list.prepare(mu.clone(), self.status())
        {
            self.reply_prepare_ack(from, code, decree);
            return Ok(());
        }

        // piggybacked commit advancement
        let committed = self.prepare_list.commit(piggyback, CommitMode::Soft);
        self.apply_committed(committed)?;
        self.publish_runtime_info();

        if let Some(private_log) = &self.private_log {
            match private_log.append(&mu) {
                Ok(ack) => {
                    self.pending_prepare_acks.insert(decree, from);
                    self.track_log_ack(LogAckKind::Private, decree, ack);
                }
                Err(e) => {
                    pf_error!(self.name();
                        "private log append failed: {}", e);
                    self.reply_prepare_ack(from, ErrCode::LogIoFailure, decree);
                    self.handle_local_failure(ErrCode::LogIoFailure);
                }
            }
        } else {
            self.reply_prepare_ack(from, ErrCode::Ok, decree);
        }
        Ok(())
    }

    pub(crate) fn reply_prepare_ack(
        &self,
        to: NodeAddr,
        err: ErrCode,
        decree: Decree,
    ) {
        let resp = PrepareResponse {
            gpid: self.gpid(),
            node: self.me(),
            err,
            ballot: self.ballot(),
            decree,
            last_committed_decree_in_app: self.app.last_committed_decree(),
            last_committed_decree_in_prepare_list: self.last_committed_decree(),
        };
        self.send_to(to, ReplicaMsg::PrepareAck(resp));
    }

    /// Primary-side handler for prepare acknowledgements.
    pub fn on_prepare_ack(&mut self, resp: PrepareResponse) {
        if self.status() != PartitionStatus::Primary {
            return;
        }

        if resp.err.is_ok() && resp.ballot == self.ballot() {
            if let Some(progress) =
                self.primary_states.progress.get_mut(&resp.decree)
            {
                progress.acked.insert(resp.node);
            }
            self.try_commit_primary();
            self.refresh_prepare_ack_timer(resp.node);
        } else if resp.ballot > self.ballot() {
            // a group member has seen a newer configuration: step down and
            // wait for the authoritative one
            pf_warn!(self.name();
                "prepare ack from {} at newer ballot {}, stepping down",
                resp.node, resp.ballot);
            let config = ReplicaConfiguration {
                gpid: self.gpid(),
                ballot: resp.ballot,
                primary: None,
                status: PartitionStatus::Inactive,
                learner_signature: None,
            };
            self.update_local_configuration(config, false);
        } else {
            pf_warn!(self.name();
                "prepare ack from {} failed with {}", resp.node, resp.err);
            self.handle_prepare_failure(resp.node);
        }
    }

    /// Fired when `node`'s ack watchdog goes off: a full timeout window
    /// passed with prepares still outstanding.
    pub(crate) fn on_prepare_timeout(&mut self, node: NodeAddr) {
        if self.status() != PartitionStatus::Primary {
            return;
        }
        if self.has_unacked_prepares(node) {
            pf_warn!(self.name();
                "prepares to {} timed out without acks", node);
            self.handle_prepare_failure(node);
        }
    }

    /// A group member failed a prepare (or went silent): ask the meta-server
    /// to downgrade it out of the write group.
    pub(crate) fn handle_prepare_failure(&mut self, node: NodeAddr) {
        if !self
            .primary_states
            .membership
            .secondaries
            .contains(&node)
        {
            return;
        }
        let mut config = self.primary_states.membership.clone();
        crate::base::remove_node(node, &mut config.secondaries);
        self.update_configuration_on_meta_server(
            crate::base::ConfigType::DowngradeToInactive,
            node,
            config,
        );
    }

    /// Ordered completion of a tracked log append.
    pub fn on_log_append_completed(
        &mut self,
        kind: LogAckKind,
        decree: Decree,
        result: Result<u64, ReplicoreError>,
    ) -> Result<(), ReplicoreError> {
        match kind {
            LogAckKind::Shared => {
                if let Err(e) = result {
                    pf_error!(self.name();
                        "shared log write for decree {} failed: {}", decree, e);
                    self.handle_local_failure(ErrCode::LogIoFailure);
                    return Ok(());
                }
                if self.status() == PartitionStatus::Primary {
                    if let Some(progress) =
                        self.primary_states.progress.get_mut(&decree)
                    {
                        progress.log_done = true;
                    }
                    self.try_commit_primary();
                }
            }
            LogAckKind::Private => {
                let deferred = self.pending_prepare_acks.remove(&decree);
                match result {
                    Ok(_) => {
                        if let Some(primary) = deferred {
                            self.reply_prepare_ack(
                                primary,
                                ErrCode::Ok,
                                decree,
                            );
                        }
                    }
                    Err(e) => {
                        pf_error!(self.name();
                            "private log write for decree {} failed: {}",
                            decree, e);
                        if let Some(primary) = deferred {
                            self.reply_prepare_ack(
                                primary,
                                ErrCode::LogIoFailure,
                                decree,
                            );
                        }
                        self.handle_local_failure(ErrCode::LogIoFailure);
                    }
                }
            }
        }
        Ok(())
    }

    /// Advances the committed decree while the next in-flight mutation is
    /// durable-on-log locally and acked by a write quorum.
    pub(crate) fn try_commit_primary(&mut self) {
        let mut advanced = false;
        loop {
            let next = self.last_committed_decree() + 1;
            let Some(progress) = self.primary_states.progress.get(&next)
            else {
                break;
            };
            let secondary_acks = progress
                .acked
                .iter()
                .filter(|n| {
                    self.primary_states
                        .membership
                        .secondaries
                        .contains(*n)
                })
                .count();
            if !progress.log_done || secondary_acks + 1 < self.write_quorum() {
                break;
            }

            let committed = self.prepare_list.commit(next, CommitMode::Soft);
            if committed.is_empty() {
                break;
            }
            if self.apply_committed(committed).is_err() {
                return;
            }
            self.primary_states.progress.remove(&next);
            advanced = true;
        }

        if advanced {
            pf_debug!(self.name();
                "committed through decree {}", self.last_committed_decree());
            self.publish_runtime_info();
        }
    }

    /// Primary: periodic liveness + configuration push to every member.
    pub fn broadcast_group_check(&mut self) {
        if self.status() != PartitionStatus::Primary {
            return;
        }

        let mut targets: Vec<(NodeAddr, PartitionStatus)> = self
            .primary_states
            .membership
            .secondaries
            .iter()
            .map(|n| (*n, PartitionStatus::Secondary))
            .collect();
        for node in self.primary_states.learners.keys() {
            targets.push((*node, PartitionStatus::PotentialSecondary));
        }

        for (node, status) in targets {
            let signature = self
                .primary_states
                .learners
                .get(&node)
                .map(|l| l.signature);
            let req = GroupCheckRequest {
                app_type: self.app_type().to_string(),
                node,
                config: self
                    .primary_states
                    .get_replica_config(status, signature),
                last_committed_decree: self.last_committed_decree(),
            };
            self.send_to(node, ReplicaMsg::GroupCheck(req));
        }
    }

    /// Member-side group check handler: adopt configuration, advance commit,
    /// and (for learners) kick the learning loop.
    pub async fn on_group_check(
        &mut self,
        from: NodeAddr,
        req: GroupCheckRequest,
    ) -> Result<(), ReplicoreError> {
        if req.config.ballot < self.ballot() {
            self.reply_group_check(from, ErrCode::StaleBallot);
            return Ok(());
        }

        if req.config.ballot > self.ballot()
            || self.is_same_ballot_status_change_allowed(
                self.status(),
                req.config.status,
            )
        {
            self.update_local_configuration(req.config.clone(), true);
        }

        match self.status() {
            PartitionStatus::Secondary => {
                let committed = self
                    .prepare_list
                    .commit(req.last_committed_decree, CommitMode::Soft);
                self.apply_committed(committed)?;
                self.publish_runtime_info();
            }
            PartitionStatus::PotentialSecondary => {
                if let Some(signature) = req.config.learner_signature {
                    self.init_learn(signature).await;
                }
            }
            _ => {}
        }

        self.reply_group_check(from, ErrCode::Ok);
        Ok(())
    }

    fn reply_group_check(&self, to: NodeAddr, err: ErrCode) {
        let resp = GroupCheckResponse {
            gpid: self.gpid(),
            node: self.me(),
            err,
            last_committed_decree_in_app: self.app.last_committed_decree(),
            last_committed_decree_in_prepare_list: self.last_committed_decree(),
            learner_status: self.potential_secondary_states.learning_status,
            learner_signature: self
                .potential_secondary_states
                .learning_signature,
        };
        self.send_to(to, ReplicaMsg::GroupCheckAck(resp));
    }

    /// Primary-side group check reply handler.
    pub fn on_group_check_ack(&mut self, resp: GroupCheckResponse) {
        if self.status() != PartitionStatus::Primary {
            return;
        }
        if !resp.err.is_ok() {
            self.handle_prepare_failure(resp.node);
            return;
        }
        if resp.learner_status == crate::base::LearnerStatus::Succeeded {
            if let Some(signature) = resp.learner_signature {
                self.handle_learning_succeeded_on_primary(
                    resp.node, signature,
                );
            }
        }
    }
}
