//! Learner catch-up: request, transfer (mutation cache, app checkpoint, or
//! private-log files), apply, and loop until converged with the prepare
//! window.

use super::*;

use crate::app::CheckpointApplyMode;
use crate::base::LearnerStatus;
use crate::messages::{
    GroupCheckRequest, GroupCheckResponse, LearnRequest, LearnResponse,
    LearnState, LearnType,
};

use tokio::time::Instant;

/// Stand-in for the remote file transfer driver: both ends of a learn run
/// on reachable filesystems, so a copy suffices.
async fn copy_learn_files(
    base: &Path,
    files: &[String],
    dst: &Path,
) -> Result<(), ReplicoreError> {
    for file in files {
        let src = base.join(file);
        let dst_path = dst.join(file);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst_path).await?;
    }
    Ok(())
}

impl Replica {
    /// Starts (or continues) a learning round under `signature`. A changed
    /// signature invalidates all prior progress.
    pub async fn init_learn(&mut self, signature: LearnSignature) {
        if self.status() != PartitionStatus::PotentialSecondary {
            pf_warn!(self.name();
                "not a potential secondary, skip learning with signature {:016x}",
                signature);
            return;
        }
        if signature == 0 {
            pf_warn!(self.name(); "invalid learning signature, skip");
            return;
        }

        if self.potential_secondary_states.learning_signature
            != Some(signature)
        {
            // learn timeout or primary change: the new epoch preempts any
            // round still in flight (its reply is dropped by signature)
            self.potential_secondary_states.cleanup(false);
            self.potential_secondary_states.learning_signature =
                Some(signature);
            self.potential_secondary_states.learning_status =
                LearnerStatus::WithoutPrepare;
            self.potential_secondary_states.learning_start =
                Some(Instant::now());
            self.prepare_list
                .reset(self.app.last_committed_decree());
        } else if self.potential_secondary_states.learning_round_is_running {
            pf_warn!(self.name();
                "previous learning round still running, skip signature {:016x}",
                signature);
            return;
        } else {
            match self.potential_secondary_states.learning_status {
                LearnerStatus::Failed | LearnerStatus::WithoutPrepare => {}
                LearnerStatus::WithPrepareTransient => {}
                LearnerStatus::WithPrepare => {
                    // learned state landed; close any gap between the app
                    // and the prepare list before declaring success
                    if !self.catch_up_after_learn().await {
                        return;
                    }
                    self.potential_secondary_states.learning_status =
                        LearnerStatus::Succeeded;
                    self.notify_learn_completion();
                    return;
                }
                LearnerStatus::Succeeded => {
                    self.notify_learn_completion();
                    return;
                }
            }
        }

        self.potential_secondary_states.learning_round_is_running = true;

        let request = LearnRequest {
            gpid: self.gpid(),
            learner: self.me(),
            signature,
            last_committed_decree_in_app: self.app.last_committed_decree(),
            last_committed_decree_in_prepare_list: self.last_committed_decree(),
            app_specific_learn_request: self.app.prepare_learn_request(),
        };

        let Some(primary) = self.config.primary else {
            pf_warn!(self.name(); "no primary known, cannot learn yet");
            self.potential_secondary_states.learning_round_is_running = false;
            return;
        };

        pf_info!(self.name();
            "init_learn[{:016x}]: learnee {}, duration {} ms, \
             app_committed {}, app_durable {}, status {}",
            signature, primary,
            self.potential_secondary_states.duration_ms(),
            self.app.last_committed_decree(),
            self.app.last_durable_decree(),
            self.potential_secondary_states.learning_status);

        self.send_to(primary, ReplicaMsg::Learn(request));
    }

    /// After learned state is in the app, the prepare list may still be
    /// ahead (commits that raced the checkpoint). Returns true when the app
    /// has fully caught up.
    async fn catch_up_after_learn(&mut self) -> bool {
        let gap_top = self.prepare_list.last_committed_decree();
        if gap_top <= self.app.last_committed_decree() {
            return true;
        }

        if self.app.last_committed_decree() + 1
            >= self.prepare_list.min_decree()
        {
            // missing commits are all inside the prepare window
            while self.app.last_committed_decree() < gap_top {
                let next = self.app.last_committed_decree() + 1;
                let Some(mu) = self.prepare_list.get(next) else {
                    self.handle_learning_error(ReplicoreError(format!(
                        "prepare window lost decree {}",
                        next
                    )));
                    return false;
                };
                if let Err(e) = self.app.write_internal(&mu) {
                    self.handle_learning_error(e);
                    return false;
                }
            }
            true
        } else {
            // missing commits predate the window; replay our own private log
            self.potential_secondary_states.learning_round_is_running = true;
            let result = self.catch_up_with_private_logs().await;
            self.potential_secondary_states.learning_round_is_running = false;
            match result {
                Ok(()) => self.app.last_committed_decree() >= gap_top || {
                    self.handle_learning_error(ReplicoreError::msg(
                        "private log catch-up left a gap",
                    ));
                    false
                },
                Err(e) => {
                    self.handle_learning_error(e);
                    false
                }
            }
        }
    }

    async fn catch_up_with_private_logs(
        &mut self,
    ) -> Result<(), ReplicoreError> {
        let Some(private_log) = &self.private_log else {
            return Err(ReplicoreError::msg(
                "private log required for log catch-up",
            ));
        };
        let (files, _) = private_log.get_learn_state(self.gpid()).await?;
        self.apply_learned_state_from_private_log(files, &[]).await
    }

    /// Learnee-side (primary) learn handler: classify what the learner needs
    /// and answer with cache, checkpoint, or log files.
    pub async fn on_learn(
        &mut self,
        from: NodeAddr,
        request: LearnRequest,
    ) -> Result<(), ReplicoreError> {
        let mut response = LearnResponse {
            err: ErrCode::Ok,
            config: self.config.clone(),
            last_committed_decree: 0,
            prepare_start_decree: None,
            learn_type: LearnType::Cache,
            state: LearnState::default(),
            base_local_dir: String::new(),
        };

        if self.status() != PartitionStatus::Primary {
            response.err = if self.status() == PartitionStatus::Inactive
                && self.inactive_is_transient
            {
                ErrCode::InactiveState
            } else {
                ErrCode::InvalidState
            };
            self.send_to(from, ReplicaMsg::LearnReply(response));
            return Ok(());
        }

        response.config = self.primary_states.get_replica_config(
            PartitionStatus::PotentialSecondary,
            None,
        );

        let signature = match self.primary_states.learners.get(&request.learner)
        {
            None => {
                response.config.status = PartitionStatus::Inactive;
                response.err = ErrCode::ObjectNotFound;
                self.send_to(from, ReplicaMsg::LearnReply(response));
                return Ok(());
            }
            Some(state) if state.signature != request.signature => {
                response.config.learner_signature = Some(state.signature);
                response.err = ErrCode::WrongChecksum;
                self.send_to(from, ReplicaMsg::LearnReply(response));
                return Ok(());
            }
            Some(state) => state.signature,
        };
        response.config.learner_signature = Some(signature);

        let mut local_committed = self.last_committed_decree();
        let mut learner_app_committed = request.last_committed_decree_in_app;

        if learner_app_committed > self.last_prepared_decree() {
            // the learner's state is from a lost lineage: relearn everything
            pf_error!(self.name();
                "on_learn[{:016x}]: learner {} state is newer than learnee \
                 ({} vs {}), learn from scratch",
                request.signature, request.learner,
                learner_app_committed, local_committed);
            learner_app_committed = 0;
        } else if learner_app_committed > local_committed {
            pf_error!(self.name();
                "on_learn[{:016x}]: learner {} committed ahead of learnee \
                 ({} vs {}), commit local hard",
                request.signature, request.learner,
                learner_app_committed, local_committed);
            let committed = self
                .prepare_list
                .commit(learner_app_committed, CommitMode::Hard);
            self.apply_committed(committed)?;
            local_committed = self.last_committed_decree();
        }

        let learn_start = learner_app_committed + 1;
        let mut delayed_replay_prepare_list = false;

        pf_info!(self.name();
            "on_learn[{:016x}]: learner {}, remote_app_committed {}, \
             local_committed {}, prepare_min {}, prepare_count {}, \
             learn_start {}",
            request.signature, request.learner, learner_app_committed,
            local_committed, self.prepare_list.min_decree(),
            self.prepare_list.count(), learn_start);

        response.last_committed_decree = local_committed;

        // the to-be-learned range is covered by the prepare window: mutation
        // cache mode. Note min_decree may not be stored when the list is
        // empty.
        let cache_covered = learn_start > self.prepare_list.min_decree()
            || (learn_start == self.prepare_list.min_decree()
                && self.prepare_list.count() > 0);

        if cache_covered {
            let name = self.name();
            let prepare_start = {
                let state = self
                    .primary_states
                    .learners
                    .get_mut(&request.learner)
                    .expect("learner checked above");
                if state.prepare_start_decree.is_none() {
                    // pinned once and reused across retries so prepares we
                    // send from here on will be accepted by this learner
                    state.prepare_start_decree = Some(local_committed + 1);
                    delayed_replay_prepare_list = true;
                    pf_info!(name;
                        "on_learn[{:016x}]: learner {}, set prepare_start_decree {}",
                        request.signature, request.learner,
                        local_committed + 1);
                }
                state.prepare_start_decree.expect("just pinned")
            };

            let mut blob = Vec::new();
            let mut count = 0u32;
            for decree in learn_start..prepare_start {
                let Some(mu) = self.prepare_list.get(decree) else {
                    return logged_err!(self.name();
                        "mutation cache lost decree {}", decree);
                };
                mu.serialize_into(&mut blob)?;
                count += 1;
            }

            response.prepare_start_decree = Some(prepare_start);
            response.learn_type = LearnType::Cache;
            response.state.from_decree_excluded = learn_start - 1;
            response.state.to_decree_included = prepare_start - 1;
            response.state.meta.push(blob);
            pf_info!(self.name();
                "on_learn[{:016x}]: learner {}, mutation cache of {} \
                 mutations in [{}, {})",
                request.signature, request.learner, count,
                learn_start, prepare_start);
        } else {
            if let Some(state) =
                self.primary_states.learners.get_mut(&request.learner)
            {
                state.prepare_start_decree = None;
            }

            if self.app.is_delta_state_learning_supported()
                || learn_start <= self.app.last_durable_decree()
            {
                match self
                    .app
                    .get_checkpoint(
                        learn_start,
                        &request.app_specific_learn_request,
                    )
                    .await
                {
                    Ok(state) => {
                        response.learn_type = LearnType::App;
                        response.base_local_dir =
                            self.app.data_dir().display().to_string();
                        response.state = state;
                        pf_info!(self.name();
                            "on_learn[{:016x}]: learner {}, app checkpoint \
                             of {} files",
                            request.signature, request.learner,
                            response.state.files.len());
                    }
                    Err(e) => {
                        pf_error!(self.name();
                            "on_learn[{:016x}]: get checkpoint failed: {}",
                            request.signature, e);
                        response.err = ErrCode::GetLearnStateFailed;
                    }
                }
            } else {
                match &self.private_log {
                    Some(private_log) => {
                        let (files, to_decree) =
                            private_log.get_learn_state(self.gpid()).await?;
                        let base = private_log.dir().to_path_buf();
                        response.learn_type = LearnType::Log;
                        response.base_local_dir =
                            base.display().to_string();
                        response.state.from_decree_excluded = learn_start - 1;
                        response.state.to_decree_included = to_decree;
                        response.state.files = files
                            .iter()
                            .filter_map(|p| {
                                p.strip_prefix(&base)
                                    .ok()
                                    .map(|r| r.display().to_string())
                            })
                            .collect();
                        pf_info!(self.name();
                            "on_learn[{:016x}]: learner {}, private log \
                             state of {} files",
                            request.signature, request.learner,
                            response.state.files.len());
                    }
                    None => {
                        pf_error!(self.name();
                            "private logging disabled and app cannot cover \
                             learn start {}", learn_start);
                        response.err = ErrCode::GetLearnStateFailed;
                    }
                }
            }
        }

        self.send_to(from, ReplicaMsg::LearnReply(response));

        // the replayed prepares must queue behind the learn response
        if delayed_replay_prepare_list {
            self.replay_prepare_list();
        }
        Ok(())
    }

    /// Learner-side learn reply handler.
    pub async fn on_learn_reply(
        &mut self,
        resp: LearnResponse,
    ) -> Result<(), ReplicoreError> {
        if self.status() != PartitionStatus::PotentialSecondary {
            pf_error!(self.name(); "not learning anymore, reply dropped");
            return Ok(());
        }
        let Some(signature) =
            self.potential_secondary_states.learning_signature
        else {
            return Ok(());
        };
        if let Some(resp_signature) = resp.config.learner_signature {
            if resp_signature != signature {
                pf_warn!(self.name();
                    "learn reply for stale signature {:016x}, dropped",
                    resp_signature);
                return Ok(());
            }
        }

        pf_info!(self.name();
            "on_learn_reply[{:016x}]: err {}, remote_committed {}, \
             prepare_start {:?}, type {:?}, files {}, status {}",
            signature, resp.err, resp.last_committed_decree,
            resp.prepare_start_decree, resp.learn_type,
            resp.state.files.len(),
            self.potential_secondary_states.learning_status);

        if !resp.err.is_ok() {
            if resp.err == ErrCode::InactiveState {
                // learnee is mid-reconfiguration; retry after a delay
                pf_warn!(self.name();
                    "learnee is updating ballot, delay next learning round");
                self.potential_secondary_states.learning_round_is_running =
                    false;
                if let Err(e) = self
                    .delay_learning_timer
                    .kickoff(Duration::from_secs(1))
                {
                    pf_warn!(self.name();
                        "failed to arm learn retry timer: {}", e);
                }
            } else {
                self.handle_learning_error(ReplicoreError(format!(
                    "learn request refused: {}",
                    resp.err
                )));
            }
            return Ok(());
        }

        if resp.config.ballot > self.ballot() {
            pf_info!(self.name();
                "on_learn_reply[{:016x}]: update configuration first", signature);
            if !self.update_local_configuration(resp.config.clone(), false) {
                return Ok(());
            }
        }
        if self.status() != PartitionStatus::PotentialSecondary {
            pf_error!(self.name(); "status changed mid-learn, stop learning");
            return Ok(());
        }

        // our own state is newer than the learnee's: discard and relearn
        // from scratch
        if resp.last_committed_decree < self.app.last_committed_decree() {
            pf_warn!(self.name();
                "on_learn_reply[{:016x}]: local app ahead of learnee \
                 ({} vs {}), recreate app",
                signature, self.app.last_committed_decree(),
                resp.last_committed_decree);
            let reset = async {
                self.app.close(true).await?;
                self.app.open(true).await?;
                Ok::<(), ReplicoreError>(())
            }
            .await;
            if let Err(e) = reset {
                self.on_learn_remote_state_completed(Err(e)).await;
                return Ok(());
            }
            self.prepare_list.reset(0);
            if let Some(private_log) = &self.private_log {
                if let Err(e) = private_log.reset().await {
                    self.on_learn_remote_state_completed(Err(e)).await;
                    return Ok(());
                }
            }
        }

        if let Some(prepare_start) = resp.prepare_start_decree {
            debug_assert_eq!(resp.learn_type, LearnType::Cache);
            debug_assert!(resp.state.files.is_empty());
            self.potential_secondary_states.learning_status =
                LearnerStatus::WithPrepareTransient;
            self.potential_secondary_states.learning_start_prepare_decree =
                Some(prepare_start);

            let app_committed = self.app.last_committed_decree();
            self.prepare_list.reset(app_committed);
            pf_info!(self.name();
                "on_learn_reply[{:016x}]: reset prepare list at {}, \
                 prepare_start {}",
                signature, app_committed, prepare_start);

            let Some(blob) = resp.state.meta.first() else {
                self.on_learn_remote_state_completed(Err(
                    ReplicoreError::msg("mutation cache reply without blob"),
                ))
                .await;
                return Ok(());
            };
            let mutations = match Mutation::parse_all(blob) {
                Ok(mutations) => mutations,
                Err(e) => {
                    self.on_learn_remote_state_completed(Err(e)).await;
                    return Ok(());
                }
            };
            for mu in mutations {
                if mu.header.decree > self.last_committed_decree() {
                    pf_debug!(self.name();
                        "apply learned mutation {}", mu.name());
                    let _ = self.prepare_list.prepare(
                        Arc::new(mu),
                        PartitionStatus::PotentialSecondary,
                    );
                }
            }

            // everything below prepare_start is known committed; the rest
            // arrives via live prepares
            let committed = self
                .prepare_list
                .commit(prepare_start - 1, CommitMode::Hard);
            if let Err(e) = self.apply_committed(committed) {
                self.on_learn_remote_state_completed(Err(e)).await;
                return Ok(());
            }

            self.potential_secondary_states.learning_status =
                LearnerStatus::WithPrepare;
            self.on_copy_remote_state_completed(Ok(()), resp).await;
        } else if !resp.state.files.is_empty() {
            let learn_dir = self.app.learn_dir();
            let _ = tokio::fs::remove_dir_all(&learn_dir).await;
            tokio::fs::create_dir_all(&learn_dir).await?;

            let base = PathBuf::from(&resp.base_local_dir);
            let copy_result =
                copy_learn_files(&base, &resp.state.files, &learn_dir).await;
            self.on_copy_remote_state_completed(copy_result, resp).await;
        } else {
            self.on_copy_remote_state_completed(Ok(()), resp).await;
        }
        Ok(())
    }

    /// Transferred state has arrived (or failed to): apply it, make it
    /// durable if we are at the catch-up boundary, then finish the round.
    async fn on_copy_remote_state_completed(
        &mut self,
        result: Result<(), ReplicoreError>,
        resp: LearnResponse,
    ) {
        let mut outcome = result;

        if outcome.is_ok() {
            match resp.learn_type {
                LearnType::Cache => {
                    // cache mutations were applied in on_learn_reply
                }
                LearnType::App => {
                    let state = resp.state.clone();
                    match self
                        .app
                        .apply_checkpoint(&state, CheckpointApplyMode::Learn)
                        .await
                    {
                        Ok(()) => {
                            debug_assert!(
                                self.app.last_committed_decree()
                                    <= resp.last_committed_decree
                            );
                            pf_info!(self.name();
                                "applied learned checkpoint, app_committed {}",
                                self.app.last_committed_decree());
                        }
                        Err(e) => outcome = Err(e),
                    }
                }
                LearnType::Log => {
                    let learn_dir = self.app.learn_dir();
                    let files: Vec<PathBuf> = resp
                        .state
                        .files
                        .iter()
                        .map(|f| learn_dir.join(f))
                        .collect();
                    outcome = self
                        .apply_learned_state_from_private_log(
                            files,
                            &resp.state.meta,
                        )
                        .await;
                }
            }
        }

        // once caught up to the prepare boundary, flush so the learned
        // state is durable before reporting success
        if outcome.is_ok() {
            if let Some(prepare_start) =
                self.potential_secondary_states.learning_start_prepare_decree
            {
                if self.app.last_committed_decree() + 1 >= prepare_start
                    && self.app.last_committed_decree()
                        > self.app.last_durable_decree()
                {
                    outcome = self.app.checkpoint().await;
                }
            }
        }

        pf_info!(self.name();
            "on_copy_remote_state_completed[{:016x}]: ok={}, appC {}, appD {}, \
             localC {}, remoteC {}, status {}",
            self.potential_secondary_states.learning_signature.unwrap_or(0),
            outcome.is_ok(),
            self.app.last_committed_decree(),
            self.app.last_durable_decree(),
            self.last_committed_decree(),
            resp.last_committed_decree,
            self.potential_secondary_states.learning_status);

        self.on_learn_remote_state_completed(outcome).await;
    }

    /// Ends the current round: on success, schedule the next one (the loop
    /// exits through `Succeeded`); on failure, this replica is done.
    async fn on_learn_remote_state_completed(
        &mut self,
        result: Result<(), ReplicoreError>,
    ) {
        if self.status() != PartitionStatus::PotentialSecondary {
            return;
        }
        self.potential_secondary_states.learning_round_is_running = false;

        match result {
            Err(e) => self.handle_learning_error(e),
            Ok(()) => {
                if let Some(signature) =
                    self.potential_secondary_states.learning_signature
                {
                    // continue on a fresh stack via the event loop
                    let _ = self
                        .tx_self()
                        .send(ReplicaEvent::InitLearn { signature });
                }
            }
        }
    }

    /// Any transport or app error during learning is terminal for this
    /// replica; the meta-server will reassign.
    pub(crate) fn handle_learning_error(&mut self, err: ReplicoreError) {
        pf_error!(self.name();
            "handle_learning_error[{:016x}]: {} after {} ms",
            self.potential_secondary_states.learning_signature.unwrap_or(0),
            err,
            self.potential_secondary_states.duration_ms());

        self.potential_secondary_states.learning_status =
            LearnerStatus::Failed;
        self.update_local_configuration_with_no_ballot_change(
            PartitionStatus::Error,
        );
    }

    pub(crate) fn handle_learning_succeeded_on_primary(
        &mut self,
        node: NodeAddr,
        signature: LearnSignature,
    ) {
        let matches = self
            .primary_states
            .learners
            .get(&node)
            .map(|l| l.signature == signature)
            .unwrap_or(false);
        if matches {
            self.upgrade_to_secondary_on_primary(node);
        }
    }

    /// Learner -> primary: report that this learner reached `Succeeded`.
    fn notify_learn_completion(&mut self) {
        let report = GroupCheckResponse {
            gpid: self.gpid(),
            node: self.me(),
            err: ErrCode::Ok,
            last_committed_decree_in_app: self.app.last_committed_decree(),
            last_committed_decree_in_prepare_list: self.last_committed_decree(),
            learner_status: self.potential_secondary_states.learning_status,
            learner_signature: self
                .potential_secondary_states
                .learning_signature,
        };

        pf_info!(self.name();
            "notify_learn_completion: appC {}, appD {}, localC {}",
            self.app.last_committed_decree(),
            self.app.last_durable_decree(),
            self.last_committed_decree());

        if let Some(primary) = self.config.primary {
            self.send_to(primary, ReplicaMsg::LearnCompletionNotify(report));
        }
    }

    /// Primary-side completion notice handler.
    pub fn on_learn_completion_notification(
        &mut self,
        report: GroupCheckResponse,
    ) {
        if self.status() != PartitionStatus::Primary {
            return;
        }
        if report.learner_status == LearnerStatus::Succeeded {
            if let Some(signature) = report.learner_signature {
                self.handle_learning_succeeded_on_primary(
                    report.node,
                    signature,
                );
            }
        }
    }

    /// One-way add-learner trigger from the primary.
    pub async fn on_add_learner(&mut self, request: GroupCheckRequest) {
        if request.config.ballot < self.ballot() {
            pf_info!(self.name(); "on_add_learner: ballot is old, skipped");
            return;
        }

        if request.config.ballot > self.ballot()
            || self.is_same_ballot_status_change_allowed(
                self.status(),
                request.config.status,
            )
        {
            if !self.update_local_configuration(request.config.clone(), true) {
                return;
            }
            debug_assert_eq!(
                self.status(),
                PartitionStatus::PotentialSecondary
            );
            if let Some(signature) = request.config.learner_signature {
                self.init_learn(signature).await;
            }
        }
    }

    /// Replays copied (or local) private-log segments through a scratch
    /// prepare list, writing every mutation that becomes committed into the
    /// app in decree order.
    pub(crate) async fn apply_learned_state_from_private_log(
        &mut self,
        files: Vec<PathBuf>,
        meta: &[Vec<u8>],
    ) -> Result<(), ReplicoreError> {
        let mut scratch = PrepareList::new(
            self.app.last_committed_decree(),
            self.options.max_mutation_count_in_prepare_list,
        );

        let mut mutations = Vec::new();
        MutationLog::replay_files(&files, |mu| mutations.push(mu)).await?;
        for blob in meta {
            mutations.extend(Mutation::parse_all(blob)?);
        }

        for mu in mutations {
            if mu.header.gpid != self.gpid() {
                continue;
            }
            let decree = mu.header.decree;
            if decree <= scratch.last_committed_decree() {
                continue;
            }
            if let Some(existing) = scratch.get(decree) {
                if existing.header.ballot >= mu.header.ballot {
                    continue;
                }
            }
            let piggyback = mu.header.last_committed_decree;
            let _ = scratch
                .prepare(Arc::new(mu), PartitionStatus::Secondary);

            // the piggybacked committed decree drives application, keeping
            // the scratch window from overflowing
            for committed in scratch.commit(piggyback, CommitMode::Soft) {
                if committed.header.decree
                    == self.app.last_committed_decree() + 1
                {
                    self.app.write_internal(&committed)?;
                }
            }
        }
        Ok(())
    }
}
