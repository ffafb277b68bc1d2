//! The per-partition replica state machine: role/configuration handling,
//! the two-phase-commit pipeline, and the learner catch-up protocol, split
//! across one file per concern.

mod configuration;
mod learn;
mod mutation;
mod prepare_list;
mod states;
mod twopc;

#[cfg(test)]
mod scenarios;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use crate::app::{AppKind, StateApp};
use crate::base::{
    Ballot, Decree, ErrCode, Gpid, LearnSignature, NodeAddr,
    PartitionConfiguration, PartitionStatus, ReplicaConfiguration,
    ReplicationConfig,
};
use crate::messages::ReplicaMsg;
use crate::utils::{ReplicoreError, Timer};
use crate::wal::{AppendAck, LogOptions, MutationLog};

use futures::stream::{FuturesOrdered, StreamExt};
use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

pub use mutation::{Mutation, MutationHeader, RPC_WRITE_EMPTY};
pub use prepare_list::{CommitMode, PrepareList};
pub use states::{
    MutationProgress, PotentialSecondaryStates, PrimaryStates,
    RemoteLearnerState, SecondaryStates,
};

/// Events arriving at a replica's single-threaded loop. Everything that can
/// touch replica state flows through here (or through direct handler calls
/// in tests), so no per-replica locks exist.
#[derive(Debug)]
pub enum ReplicaEvent {
    /// An inbound message routed by the stub.
    Msg { from: NodeAddr, msg: ReplicaMsg },
    /// A client write landed on this (hopefully primary) replica.
    ClientWrite {
        payload: Vec<u8>,
        rpc_code: u32,
        client_request_id: u64,
    },
    /// Kick (or re-kick) a learning round.
    InitLearn { signature: LearnSignature },
    /// Retry the current learning epoch after a backoff.
    RetryLearn,
    /// Resend an outstanding reconfiguration request.
    RetryReconfiguration,
    /// `node` went a full prepare-timeout window without acking.
    PrepareTimeout { node: NodeAddr },
    /// Graceful shutdown of this replica's loop.
    Close,
}

/// Which log an append acknowledgement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAckKind {
    Shared,
    Private,
}

/// Snapshot of a replica's progress, pushed to the stub for GC and
/// monitoring.
#[derive(Debug, Clone)]
pub struct ReplicaRuntimeInfo {
    pub gpid: Gpid,
    pub status: PartitionStatus,
    pub ballot: Ballot,
    pub last_committed_decree: Decree,
    pub last_durable_decree: Decree,
}

/// Notifications a replica sends up to its owning stub.
#[derive(Debug)]
pub enum StubNotice {
    /// Status/ballot changed; `is_closing` asks the stub to retire us.
    StateUpdate {
        config: ReplicaConfiguration,
        is_closing: bool,
    },
    /// Progress refresh for shared-log GC.
    Runtime(ReplicaRuntimeInfo),
    /// The authoritative config dropped us; ask the meta-server to forget
    /// this replica.
    RemoveReplicaOnMeta(PartitionConfiguration),
}

type LogAckFuture =
    Pin<Box<dyn Future<Output = (LogAckKind, Decree, Result<u64, ReplicoreError>)> + Send>>;

/// One partition replica. Owned and driven by the stub; all state mutations
/// happen on its event loop (or on the test thread driving handlers
/// directly).
pub struct Replica {
    dir: PathBuf,
    me: NodeAddr,
    options: Arc<ReplicationConfig>,
    app_type: String,

    pub(crate) config: ReplicaConfiguration,
    pub(crate) inactive_is_transient: bool,

    pub(crate) app: Box<dyn StateApp>,
    pub(crate) prepare_list: PrepareList,

    pub(crate) primary_states: PrimaryStates,
    pub(crate) secondary_states: SecondaryStates,
    pub(crate) potential_secondary_states: PotentialSecondaryStates,

    pub(crate) shared_log: Arc<MutationLog>,
    pub(crate) private_log: Option<MutationLog>,

    tx_out: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
    tx_stub: mpsc::UnboundedSender<StubNotice>,
    tx_self: mpsc::UnboundedSender<ReplicaEvent>,
    rx_self: Option<mpsc::UnboundedReceiver<ReplicaEvent>>,
    meta_leader: Arc<StdMutex<NodeAddr>>,

    pending_log_acks: FuturesOrdered<LogAckFuture>,
    /// Prepares whose ack is deferred until the private-log append lands,
    /// keyed by decree, holding the primary to reply to.
    pub(crate) pending_prepare_acks: std::collections::HashMap<Decree, NodeAddr>,

    /// Primary-side per-member ack watchdogs: armed while a member has
    /// unacked prepares, re-armed on each ack, fired after a silent window.
    pub(crate) prepare_ack_timers: std::collections::HashMap<NodeAddr, Timer>,
    /// Backoff for resending an outstanding reconfiguration request.
    pub(crate) reconfiguration_retry_timer: Timer,
    /// Backoff before the next learning round when the learnee was busy.
    pub(crate) delay_learning_timer: Timer,

    closed: bool,
}

impl Replica {
    /// Creates a brand-new replica for a freshly-assigned gpid: an empty app
    /// plus (unless disabled) an empty private log, rooted at `dir`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        gpid: Gpid,
        app_type: &str,
        dir: PathBuf,
        me: NodeAddr,
        options: Arc<ReplicationConfig>,
        shared_log: Arc<MutationLog>,
        tx_out: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
        tx_stub: mpsc::UnboundedSender<StubNotice>,
        meta_leader: Arc<StdMutex<NodeAddr>>,
    ) -> Result<Replica, ReplicoreError> {
        let kind = AppKind::parse_name(app_type).ok_or_else(|| {
            ReplicoreError(format!("unknown app type '{}'", app_type))
        })?;
        tokio::fs::create_dir_all(&dir).await?;

        let mut app = kind.create(&dir);
        app.open(true).await?;

        let private_log = if options.log_private_disabled {
            None
        } else {
            let log =
                MutationLog::open(&dir, LogOptions::private_log(&options))
                    .await?;
            log.start_write_service(
                BTreeMap::new(),
                options.staleness_for_commit as u32,
            )?;
            Some(log)
        };

        Ok(Self::assemble(
            gpid,
            app_type,
            dir,
            me,
            options,
            app,
            0,
            shared_log,
            private_log,
            tx_out,
            tx_stub,
            meta_leader,
        ))
    }

    /// Loads a replica back from its on-disk directory: reopens the app from
    /// its latest checkpoint and replays the private log into the prepare
    /// list and app. Shared-log mutations are injected afterwards by the
    /// stub via [`Replica::replay_mutation`].
    #[allow(clippy::too_many_arguments)]
    pub async fn load(
        gpid: Gpid,
        app_type: &str,
        dir: PathBuf,
        me: NodeAddr,
        options: Arc<ReplicationConfig>,
        shared_log: Arc<MutationLog>,
        tx_out: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
        tx_stub: mpsc::UnboundedSender<StubNotice>,
        meta_leader: Arc<StdMutex<NodeAddr>>,
    ) -> Result<Replica, ReplicoreError> {
        let kind = AppKind::parse_name(app_type).ok_or_else(|| {
            ReplicoreError(format!("unknown app type '{}'", app_type))
        })?;

        let mut app = kind.create(&dir);
        app.open(false).await?;

        let mut replayed = Vec::new();
        let private_log = if options.log_private_disabled {
            None
        } else {
            let log =
                MutationLog::open(&dir, LogOptions::private_log(&options))
                    .await?;
            log.replay(|mu| replayed.push(mu)).await?;
            log.start_write_service(
                BTreeMap::new(),
                options.staleness_for_commit as u32,
            )?;
            Some(log)
        };

        let mut replica = Self::assemble(
            gpid,
            app_type,
            dir,
            me,
            options,
            app,
            0,
            shared_log,
            private_log,
            tx_out,
            tx_stub,
            meta_leader,
        );
        replica
            .prepare_list
            .reset(replica.app.last_committed_decree());
        for mu in replayed {
            replica.replay_mutation(mu)?;
        }
        Ok(replica)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        gpid: Gpid,
        app_type: &str,
        dir: PathBuf,
        me: NodeAddr,
        options: Arc<ReplicationConfig>,
        app: Box<dyn StateApp>,
        init_decree: Decree,
        shared_log: Arc<MutationLog>,
        private_log: Option<MutationLog>,
        tx_out: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
        tx_stub: mpsc::UnboundedSender<StubNotice>,
        meta_leader: Arc<StdMutex<NodeAddr>>,
    ) -> Replica {
        let (tx_self, rx_self) = mpsc::unbounded_channel();

        let reconfiguration_retry_timer = Timer::new(Some({
            let tx_self = tx_self.clone();
            move || {
                let _ = tx_self.send(ReplicaEvent::RetryReconfiguration);
            }
        }));
        let delay_learning_timer = Timer::new(Some({
            let tx_self = tx_self.clone();
            move || {
                let _ = tx_self.send(ReplicaEvent::RetryLearn);
            }
        }));

        Replica {
            dir,
            me,
            app_type: app_type.to_string(),
            config: ReplicaConfiguration {
                gpid,
                ballot: 0,
                primary: None,
                status: PartitionStatus::Inactive,
                learner_signature: None,
            },
            inactive_is_transient: false,
            prepare_list: PrepareList::new(
                init_decree,
                options.max_mutation_count_in_prepare_list,
            ),
            primary_states: PrimaryStates::new(gpid, app_type.to_string()),
            secondary_states: SecondaryStates::default(),
            potential_secondary_states: PotentialSecondaryStates::default(),
            options,
            app,
            shared_log,
            private_log,
            tx_out,
            tx_stub,
            tx_self,
            rx_self: Some(rx_self),
            meta_leader,
            pending_log_acks: FuturesOrdered::new(),
            pending_prepare_acks: std::collections::HashMap::new(),
            prepare_ack_timers: std::collections::HashMap::new(),
            reconfiguration_retry_timer,
            delay_learning_timer,
            closed: false,
        }
    }

    // basic accessors

    pub fn gpid(&self) -> Gpid {
        self.config.gpid
    }

    pub fn status(&self) -> PartitionStatus {
        self.config.status
    }

    pub fn ballot(&self) -> Ballot {
        self.config.ballot
    }

    pub fn app_type(&self) -> &str {
        &self.app_type
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn me(&self) -> NodeAddr {
        self.me
    }

    pub fn name(&self) -> String {
        format!("{}@{}", self.config.gpid, self.config.status)
    }

    pub fn last_committed_decree(&self) -> Decree {
        self.prepare_list.last_committed_decree()
    }

    pub fn max_prepared_decree(&self) -> Decree {
        self.prepare_list.max_decree()
    }

    pub(crate) fn last_prepared_decree(&self) -> Decree {
        self.prepare_list.max_decree()
    }

    pub fn app(&self) -> &dyn StateApp {
        self.app.as_ref()
    }

    /// Self-sender for spawned timer tasks.
    pub(crate) fn tx_self(&self) -> mpsc::UnboundedSender<ReplicaEvent> {
        self.tx_self.clone()
    }

    /// Replicas that must acknowledge a write, including the primary.
    pub fn write_quorum(&self) -> usize {
        let members = 1 + self.primary_states.membership.secondaries.len();
        self.options
            .mutation_2pc_min_replica_count
            .max(members / 2 + 1)
    }

    // messaging helpers

    pub(crate) fn send_to(&self, node: NodeAddr, msg: ReplicaMsg) {
        if self.tx_out.send((node, msg)).is_err() {
            pf_warn!(self.name(); "outbound channel closed, message dropped");
        }
    }

    pub(crate) fn send_meta(&self, msg: ReplicaMsg) {
        let target = *self
            .meta_leader
            .lock()
            .expect("meta leader mutex poisoned");
        self.send_to(target, msg);
    }

    pub(crate) fn notify_stub(&self, notice: StubNotice) {
        if self.tx_stub.send(notice).is_err() {
            pf_warn!(self.name(); "stub channel closed, notice dropped");
        }
    }

    pub(crate) fn runtime_info(&self) -> ReplicaRuntimeInfo {
        ReplicaRuntimeInfo {
            gpid: self.config.gpid,
            status: self.config.status,
            ballot: self.config.ballot,
            last_committed_decree: self.last_committed_decree(),
            last_durable_decree: self.app.last_durable_decree(),
        }
    }

    pub(crate) fn publish_runtime_info(&self) {
        self.notify_stub(StubNotice::Runtime(self.runtime_info()));
    }

    pub(crate) fn set_inactive_state_transient(&mut self, transient: bool) {
        self.inactive_is_transient = transient;
    }

    /// Applies newly-committed mutations to the app, in decree order. An app
    /// failure is terminal for this replica.
    pub(crate) fn apply_committed(
        &mut self,
        committed: Vec<Arc<Mutation>>,
    ) -> Result<(), ReplicoreError> {
        for mu in committed {
            let app_decree = self.app.last_committed_decree();
            if mu.header.decree <= app_decree {
                continue;
            }
            if let Err(e) = self.app.write_internal(&mu) {
                pf_error!(self.name();
                    "app write for mutation {} failed: {}", mu.name(), e);
                self.handle_local_failure(ErrCode::LocalAppFailure);
                return Err(e);
            }
        }
        Ok(())
    }

    /// `LocalAppFailure` / `LogIoFailure` handling: the replica goes to
    /// ERROR and waits for the meta-server to reassign.
    pub(crate) fn handle_local_failure(&mut self, err: ErrCode) {
        pf_error!(self.name(); "local failure {}, moving to error state", err);
        self.update_local_configuration_with_no_ballot_change(
            PartitionStatus::Error,
        );
    }

    /// Tracks a log append acknowledgement; completions are delivered in
    /// append order through the event loop (or `pump_one_log_ack`).
    pub(crate) fn track_log_ack(
        &mut self,
        kind: LogAckKind,
        decree: Decree,
        ack: AppendAck,
    ) {
        self.pending_log_acks.push_back(Box::pin(async move {
            let result = match ack.await {
                Ok(inner) => inner,
                Err(e) => Err(ReplicoreError::from(e)),
            };
            (kind, decree, result)
        }));
    }

    /// Waits for the next log acknowledgement and dispatches it. Test
    /// harness entry point; the event loop does the same inline.
    pub async fn pump_one_log_ack(&mut self) -> Result<(), ReplicoreError> {
        if let Some((kind, decree, result)) =
            self.pending_log_acks.next().await
        {
            self.on_log_append_completed(kind, decree, result)?;
        }
        Ok(())
    }

    /// Drains every tracked log acknowledgement.
    pub async fn pump_log_acks(&mut self) -> Result<(), ReplicoreError> {
        while !self.pending_log_acks.is_empty() {
            self.pump_one_log_ack().await?;
        }
        Ok(())
    }

    /// Whether any log acknowledgement is still in flight.
    pub fn has_pending_log_acks(&self) -> bool {
        !self.pending_log_acks.is_empty()
    }

    /// Pulls already-queued self events (timer firings and the like) without
    /// blocking. Test harness helper; the event loop consumes these live.
    pub fn drain_self_events(&mut self) -> Vec<ReplicaEvent> {
        let mut events = Vec::new();
        if let Some(rx) = self.rx_self.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        events
    }

    /// Re-injects one replayed mutation (private or shared log recovery):
    /// prepares it and advances commit per the piggybacked committed decree.
    pub fn replay_mutation(&mut self, mu: Mutation) -> Result<(), ReplicoreError> {
        if mu.header.gpid != self.config.gpid {
            return Ok(());
        }
        let piggyback = mu.header.last_committed_decree;
        if mu.header.decree > self.prepare_list.last_committed_decree() {
            let mu = Arc::new(mu);
            if let Some(existing) = self.prepare_list.get(mu.header.decree) {
                if existing.header.ballot >= mu.header.ballot {
                    return Ok(());
                }
            }
            let _ = self
                .prepare_list
                .prepare(mu, PartitionStatus::Inactive);
        }
        let committed = self.prepare_list.commit(piggyback, CommitMode::Soft);
        self.apply_committed(committed)?;
        Ok(())
    }

    /// Main event loop. All replica work is serialized here.
    pub async fn run(&mut self) -> Result<(), ReplicoreError> {
        let mut rx_self = match self.rx_self.take() {
            Some(rx) => rx,
            None => {
                return logged_err!(self.name(); "replica loop already running")
            }
        };

        let mut group_check = time::interval(Duration::from_millis(
            self.options.group_check_interval_ms.max(1),
        ));
        group_check.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut checkpoint_tick = time::interval(Duration::from_secs(
            self.options.checkpoint_interval_seconds.max(1),
        ));
        checkpoint_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx_self.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event, ReplicaEvent::Close) {
                        self.close().await;
                        break;
                    }
                    if let Err(e) = self.handle_event(event).await {
                        pf_error!(self.name(); "error handling event: {}", e);
                    }
                },

                Some((kind, decree, result)) = self.pending_log_acks.next(),
                    if !self.pending_log_acks.is_empty() =>
                {
                    if let Err(e) =
                        self.on_log_append_completed(kind, decree, result)
                    {
                        pf_error!(self.name(); "error handling log ack: {}", e);
                    }
                },

                _ = group_check.tick() => {
                    if self.status() == PartitionStatus::Primary {
                        self.broadcast_group_check();
                    }
                },

                _ = checkpoint_tick.tick() => {
                    if let Err(e) = self.on_checkpoint_tick().await {
                        pf_error!(self.name(); "error during checkpoint: {}", e);
                    }
                },
            }

            if self.closed {
                break;
            }
        }
        Ok(())
    }

    /// Dispatches one event to the matching handler.
    pub async fn handle_event(
        &mut self,
        event: ReplicaEvent,
    ) -> Result<(), ReplicoreError> {
        match event {
            ReplicaEvent::Msg { from, msg } => self.handle_msg(from, msg).await,
            ReplicaEvent::ClientWrite {
                payload,
                rpc_code,
                client_request_id,
            } => {
                let _ = self.on_client_write(payload, rpc_code, client_request_id);
                Ok(())
            }
            ReplicaEvent::InitLearn { signature } => {
                self.init_learn(signature).await;
                Ok(())
            }
            ReplicaEvent::RetryLearn => {
                if let Some(signature) =
                    self.potential_secondary_states.learning_signature
                {
                    self.init_learn(signature).await;
                }
                Ok(())
            }
            ReplicaEvent::RetryReconfiguration => {
                self.retry_update_configuration_on_meta_server();
                Ok(())
            }
            ReplicaEvent::PrepareTimeout { node } => {
                self.on_prepare_timeout(node);
                Ok(())
            }
            ReplicaEvent::Close => Ok(()), // handled in run()
        }
    }

    /// Dispatches one inbound message to the matching handler.
    pub async fn handle_msg(
        &mut self,
        from: NodeAddr,
        msg: ReplicaMsg,
    ) -> Result<(), ReplicoreError> {
        match msg {
            ReplicaMsg::Prepare(req) => self.on_prepare(from, req),
            ReplicaMsg::PrepareAck(resp) => {
                self.on_prepare_ack(resp);
                Ok(())
            }
            ReplicaMsg::GroupCheck(req) => {
                self.on_group_check(from, req).await
            }
            ReplicaMsg::GroupCheckAck(resp) => {
                self.on_group_check_ack(resp);
                Ok(())
            }
            ReplicaMsg::Learn(req) => self.on_learn(from, req).await,
            ReplicaMsg::LearnReply(resp) => self.on_learn_reply(resp).await,
            ReplicaMsg::AddLearner(req) => {
                self.on_add_learner(req).await;
                Ok(())
            }
            ReplicaMsg::LearnCompletionNotify(report) => {
                self.on_learn_completion_notification(report);
                Ok(())
            }
            ReplicaMsg::RemoveReplica(config) => {
                self.on_remove(config);
                Ok(())
            }
            ReplicaMsg::ConfigProposal(proposal) => {
                self.on_config_proposal(proposal);
                Ok(())
            }
            ReplicaMsg::UpdateConfigurationReply(resp) => {
                self.on_update_configuration_reply(resp);
                Ok(())
            }
            ReplicaMsg::ConfigSync(config) => {
                self.on_config_sync(config);
                Ok(())
            }
            ReplicaMsg::QueryDecree { gpid } => {
                let reply = ReplicaMsg::QueryDecreeReply {
                    gpid,
                    last_committed_decree: self.last_committed_decree(),
                };
                self.send_to(from, reply);
                Ok(())
            }
            other => {
                pf_warn!(self.name(); "unexpected message: {:?}", other);
                Ok(())
            }
        }
    }

    /// Periodic checkpoint: push app durability forward once the committed
    /// vs durable gap warrants it.
    pub async fn on_checkpoint_tick(&mut self) -> Result<(), ReplicoreError> {
        if !matches!(
            self.status(),
            PartitionStatus::Primary | PartitionStatus::Secondary
        ) {
            return Ok(());
        }
        let gap = self
            .app
            .last_committed_decree()
            .saturating_sub(self.app.last_durable_decree());
        if gap == 0 || gap < self.options.checkpoint_min_decree_gap {
            return Ok(());
        }

        if self.status() == PartitionStatus::Secondary {
            self.secondary_states.checkpoint_is_running = true;
        }
        let result = self.app.checkpoint().await;
        self.secondary_states.checkpoint_is_running = false;
        if let Err(e) = result {
            pf_error!(self.name(); "checkpoint failed: {}", e);
            self.handle_local_failure(ErrCode::LocalAppFailure);
            return Err(e);
        }

        self.publish_runtime_info();
        Ok(())
    }

    /// Disarms and drops every per-member ack watchdog.
    pub(crate) fn clear_prepare_ack_timers(&mut self) {
        self.prepare_ack_timers.clear();
    }

    /// Shuts this replica down: cancels learner/reconfiguration work and
    /// closes the app (keeping durable state unless we are in ERROR after a
    /// disk problem, which the stub handles by moving the directory aside).
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.potential_secondary_states.cleanup(true);
        self.primary_states.cleanup(true);
        self.secondary_states.cleanup(true);
        self.clear_prepare_ack_timers();
        let _ = self.reconfiguration_retry_timer.cancel();
        let _ = self.delay_learning_timer.cancel();

        if let Err(e) = self.app.close(false).await {
            pf_warn!(self.name(); "app close failed: {}", e);
        }
        pf_info!(self.name(); "replica closed");
    }
}
