//! Process-wide coordinator of all local replicas: disk load, event-loop
//! spawning, message routing by gpid, shared-log garbage collection, and
//! the meta-server failure-detector binding.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::base::{
    ConfigType, Decree, Gpid, NodeAddr, ReplicationConfig,
};
use crate::fd::{BeaconFollowup, FailureDetector, FdEvent, FdOptions};
use crate::messages::{
    ConfigProposalRequest, NodeReport, ReplicaLoadInfo, ReplicaMsg,
};
use crate::replica::{
    Replica, ReplicaEvent, ReplicaRuntimeInfo, StubNotice,
};
use crate::utils::ReplicoreError;
use crate::wal::{LogOptions, MutationLog};

use rand::Rng;

use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Subdirectory of the root holding the shared log's segments.
const SHARED_LOG_DIR: &str = "slog";

/// Replica directory naming: `<app_id>.<partition_index>.<app_type>`.
pub fn replica_dir_name(gpid: Gpid, app_type: &str) -> String {
    format!("{}.{}.{}", gpid.app_id, gpid.partition_index, app_type)
}

/// Parses a replica directory name back into its gpid and app type.
pub fn parse_replica_dir_name(name: &str) -> Option<(Gpid, String)> {
    if name.ends_with(".err") {
        return None;
    }
    let mut parts = name.splitn(3, '.');
    let app_id = parts.next()?.parse::<u32>().ok()?;
    let partition_index = parts.next()?.parse::<u32>().ok()?;
    let app_type = parts.next()?;
    if app_type.is_empty() {
        return None;
    }
    Some((Gpid::new(app_id, partition_index), app_type.to_string()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Routing endpoint of one spawned replica.
struct ReplicaHandle {
    tx_event: mpsc::UnboundedSender<ReplicaEvent>,
    task: JoinHandle<()>,
}

/// A retired replica whose loop is draining; released from memory after
/// `gc_memory_replica_interval_ms`.
struct ClosedReplica {
    gpid: Gpid,
    closed_at: Instant,
    task: JoinHandle<()>,
}

/// The per-process replica coordinator.
pub struct ReplicaStub {
    me: NodeAddr,
    root_dir: PathBuf,
    options: Arc<ReplicationConfig>,
    shared_log: Arc<MutationLog>,

    replicas: HashMap<Gpid, ReplicaHandle>,
    runtime_infos: HashMap<Gpid, ReplicaRuntimeInfo>,
    closed_replicas: Vec<ClosedReplica>,

    tx_out: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
    tx_stub: mpsc::UnboundedSender<StubNotice>,
    rx_stub: mpsc::UnboundedReceiver<StubNotice>,
    tx_in: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
    rx_in: mpsc::UnboundedReceiver<(NodeAddr, ReplicaMsg)>,

    meta_leader: Arc<StdMutex<NodeAddr>>,
    fd: FailureDetector,
    meta_connected: bool,
}

impl ReplicaStub {
    /// Opens the shared log, loads every replica directory found under
    /// `root_dir` (renaming corrupt ones aside), replays the shared log
    /// into them, and spawns their event loops.
    pub async fn new_and_setup(
        me: NodeAddr,
        root_dir: &Path,
        meta_servers: Vec<NodeAddr>,
        options: ReplicationConfig,
        tx_out: mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)>,
    ) -> Result<ReplicaStub, ReplicoreError> {
        options.sanity_check()?;
        let options = Arc::new(options);
        fs::create_dir_all(root_dir).await?;

        let fd = FailureDetector::new(
            me,
            meta_servers,
            FdOptions::from_config(&options),
        );
        let meta_leader = Arc::new(StdMutex::new(fd.current_leader()));

        let shared_log = Arc::new(
            MutationLog::open(
                &root_dir.join(SHARED_LOG_DIR),
                LogOptions::shared(&options),
            )
            .await?,
        );

        let (tx_stub, rx_stub) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();

        // load replicas from their directories, setting corrupt ones aside
        let mut loaded: HashMap<Gpid, Replica> = HashMap::new();
        let mut entries = fs::read_dir(root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((gpid, app_type)) = parse_replica_dir_name(name) else {
                continue;
            };

            match Replica::load(
                gpid,
                &app_type,
                entry.path(),
                me,
                options.clone(),
                shared_log.clone(),
                tx_out.clone(),
                tx_stub.clone(),
                meta_leader.clone(),
            )
            .await
            {
                Ok(replica) => {
                    pf_info!("stub"; "loaded replica {} from {}", gpid, name);
                    loaded.insert(gpid, replica);
                }
                Err(e) => {
                    pf_error!("stub";
                        "failed to load replica dir {}: {}", name, e);
                    move_dir_aside(root_dir, name).await?;
                }
            }
        }

        // shared-log recovery: route every surviving mutation to its replica
        let mut replayed = Vec::new();
        shared_log.replay(|mu| replayed.push(mu)).await?;
        for mu in replayed {
            if let Some(replica) = loaded.get_mut(&mu.header.gpid) {
                replica.replay_mutation(mu)?;
            }
        }

        let init_max_decrees: BTreeMap<Gpid, Decree> = loaded
            .iter()
            .map(|(gpid, r)| (*gpid, r.max_prepared_decree()))
            .collect();
        shared_log.start_write_service(
            init_max_decrees,
            options.staleness_for_commit as u32,
        )?;

        let mut stub = ReplicaStub {
            me,
            root_dir: root_dir.to_path_buf(),
            options,
            shared_log,
            replicas: HashMap::new(),
            runtime_infos: HashMap::new(),
            closed_replicas: Vec::new(),
            tx_out,
            tx_stub,
            rx_stub,
            tx_in,
            rx_in,
            meta_leader,
            fd,
            meta_connected: false,
        };
        for (_, replica) in loaded {
            stub.spawn_replica(replica);
        }
        Ok(stub)
    }

    pub fn me(&self) -> NodeAddr {
        self.me
    }

    pub fn shared_log(&self) -> &Arc<MutationLog> {
        &self.shared_log
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn runtime_info(&self, gpid: Gpid) -> Option<&ReplicaRuntimeInfo> {
        self.runtime_infos.get(&gpid)
    }

    /// Endpoint the host's transport feeds inbound messages into.
    pub fn inbound_sender(
        &self,
    ) -> mpsc::UnboundedSender<(NodeAddr, ReplicaMsg)> {
        self.tx_in.clone()
    }

    fn spawn_replica(&mut self, mut replica: Replica) {
        let gpid = replica.gpid();
        self.runtime_infos.insert(gpid, replica.runtime_info());
        let name = replica.name();
        let tx_event = replica.tx_self();
        let task = tokio::spawn(async move {
            if let Err(e) = replica.run().await {
                pf_error!(name; "replica loop ended with error: {}", e);
            }
        });
        self.replicas.insert(gpid, ReplicaHandle { tx_event, task });
    }

    /// Creates (and spawns) a replica for a newly-assigned gpid.
    pub async fn open_replica(
        &mut self,
        gpid: Gpid,
        app_type: &str,
    ) -> Result<(), ReplicoreError> {
        if self.replicas.contains_key(&gpid) {
            return Ok(());
        }
        let dir = self.root_dir.join(replica_dir_name(gpid, app_type));
        let replica = Replica::create(
            gpid,
            app_type,
            dir,
            self.me,
            self.options.clone(),
            self.shared_log.clone(),
            self.tx_out.clone(),
            self.tx_stub.clone(),
            self.meta_leader.clone(),
        )
        .await?;
        pf_info!("stub"; "opened new replica {} ({})", gpid, app_type);
        self.spawn_replica(replica);
        Ok(())
    }

    /// Routes one inbound message to the right replica (creating one for
    /// fresh assignments), or handles it at stub level.
    pub async fn on_msg(
        &mut self,
        from: NodeAddr,
        msg: ReplicaMsg,
    ) -> Result<(), ReplicoreError> {
        match &msg {
            ReplicaMsg::BeaconAck(ack) => {
                self.on_beacon_ack(Some(*ack));
                return Ok(());
            }
            ReplicaMsg::Beacon(_) => {
                pf_warn!("stub"; "replica server received a beacon, dropped");
                return Ok(());
            }
            _ => {}
        }

        let Some(gpid) = msg.gpid() else {
            return Ok(());
        };

        if !self.replicas.contains_key(&gpid) {
            // fresh assignment paths create the replica on demand
            match &msg {
                ReplicaMsg::AddLearner(req) => {
                    self.open_replica(gpid, &req.app_type).await?;
                }
                ReplicaMsg::ConfigProposal(proposal) => {
                    self.open_replica(gpid, &proposal.config.app_type)
                        .await?;
                }
                ReplicaMsg::QueryDecree { .. } => {
                    let reply = ReplicaMsg::QueryDecreeReply {
                        gpid,
                        last_committed_decree: 0,
                    };
                    let _ = self.tx_out.send((from, reply));
                    return Ok(());
                }
                _ => {
                    pf_debug!("stub";
                        "message for unknown replica {} dropped", gpid);
                    return Ok(());
                }
            }
        }

        if let Some(handle) = self.replicas.get(&gpid) {
            if handle
                .tx_event
                .send(ReplicaEvent::Msg { from, msg })
                .is_err()
            {
                pf_warn!("stub";
                    "replica {} loop is gone, message dropped", gpid);
            }
        }
        Ok(())
    }

    /// Applies one notification from a replica.
    pub fn handle_notice(&mut self, notice: StubNotice) {
        match notice {
            StubNotice::Runtime(info) => {
                self.runtime_infos.insert(info.gpid, info);
            }
            StubNotice::StateUpdate { config, is_closing } => {
                pf_debug!("stub";
                    "replica {} now {} at ballot {}",
                    config.gpid, config.status, config.ballot);
                if is_closing {
                    self.begin_close_replica(config.gpid);
                }
            }
            StubNotice::RemoveReplicaOnMeta(config) => {
                self.remove_replica_on_meta_server(config);
            }
        }
    }

    /// Asks the meta-server to drop this node from a partition it no longer
    /// serves.
    fn remove_replica_on_meta_server(
        &self,
        config: crate::base::PartitionConfiguration,
    ) {
        let mut request = ConfigProposalRequest {
            kind: ConfigType::Remove,
            node: self.me,
            config,
        };
        request.config.ballot += 1;
        if request.config.primary == Some(self.me) {
            request.config.primary = None;
        } else {
            crate::base::remove_node(
                self.me,
                &mut request.config.secondaries,
            );
        }
        let target = *self
            .meta_leader
            .lock()
            .expect("meta leader mutex poisoned");
        let _ = self
            .tx_out
            .send((target, ReplicaMsg::UpdateConfiguration(request)));
    }

    /// Retires a replica: its loop drains asynchronously, its decrees no
    /// longer pin shared-log segments, and its bookkeeping lingers until
    /// the memory GC interval elapses.
    pub fn begin_close_replica(&mut self, gpid: Gpid) {
        let Some(handle) = self.replicas.remove(&gpid) else {
            return;
        };
        pf_info!("stub"; "closing replica {}", gpid);
        let _ = handle.tx_event.send(ReplicaEvent::Close);
        self.closed_replicas.push(ClosedReplica {
            gpid,
            closed_at: Instant::now(),
            task: handle.task,
        });
        self.runtime_infos.remove(&gpid);
        if let Err(e) = self.shared_log.on_partition_removed(gpid) {
            pf_warn!("stub"; "shared log partition removal failed: {}", e);
        }
    }

    /// Releases closed replicas that have finished draining and sat past
    /// `gc_memory_replica_interval_ms`.
    pub fn reclaim_closed_replicas(&mut self) {
        let hold = Duration::from_millis(
            self.options.gc_memory_replica_interval_ms,
        );
        self.closed_replicas.retain(|closed| {
            if closed.closed_at.elapsed() < hold {
                return true;
            }
            pf_info!("stub"; "releasing closed replica {}", closed.gpid);
            closed.task.abort();
            false
        });
    }

    /// Deletes `.err` replica directories older than
    /// `gc_disk_error_replica_interval_seconds`.
    pub async fn purge_error_replica_dirs(
        &self,
    ) -> Result<usize, ReplicoreError> {
        let hold = std::time::Duration::from_secs(
            self.options.gc_disk_error_replica_interval_seconds,
        );
        let mut purged = 0usize;
        let mut entries = fs::read_dir(&self.root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".err") {
                continue;
            }
            let age = entry
                .metadata()
                .await?
                .modified()
                .ok()
                .and_then(|t| t.elapsed().ok());
            if age.map(|a| a >= hold).unwrap_or(false) {
                fs::remove_dir_all(entry.path()).await?;
                pf_warn!("stub"; "purged error replica dir {}", name);
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Asks the meta-server for the authoritative configurations of every
    /// partition this node serves; replies flow back as config syncs.
    fn query_configurations(&self) {
        let target = *self
            .meta_leader
            .lock()
            .expect("meta leader mutex poisoned");
        let _ = self.tx_out.send((
            target,
            ReplicaMsg::QueryConfigurationByNode { node: self.me },
        ));
    }

    /// Reports per-replica progress to the meta-server's balancer.
    fn send_node_report(&self) {
        let replicas: Vec<ReplicaLoadInfo> = self
            .runtime_infos
            .values()
            .map(|info| ReplicaLoadInfo {
                gpid: info.gpid,
                status: info.status,
                ballot: info.ballot,
                last_committed_decree: info.last_committed_decree,
                last_durable_decree: info.last_durable_decree,
            })
            .collect();
        let report = NodeReport {
            node: self.me,
            replicas,
        };
        let target = *self
            .meta_leader
            .lock()
            .expect("meta leader mutex poisoned");
        let _ = self
            .tx_out
            .send((target, ReplicaMsg::NodeReport(report)));
    }

    /// One round of shared-log garbage collection from current replica
    /// progress.
    pub async fn gc_once(&self) -> Result<usize, ReplicoreError> {
        let durable_decrees: BTreeMap<Gpid, Decree> = self
            .runtime_infos
            .iter()
            .map(|(gpid, info)| (*gpid, info.last_durable_decree))
            .collect();
        let max_seen_decrees: BTreeMap<Gpid, Decree> = self
            .runtime_infos
            .iter()
            .map(|(gpid, info)| (*gpid, info.last_committed_decree))
            .collect();
        self.shared_log
            .garbage_collection(durable_decrees, max_seen_decrees)
            .await
    }

    fn send_beacon(&mut self) {
        let beacon = self.fd.make_beacon(Instant::now(), now_ms());
        let _ = self
            .tx_out
            .send((beacon.to_addr, ReplicaMsg::Beacon(beacon)));
    }

    fn on_beacon_ack(&mut self, ack: Option<crate::messages::BeaconAck>) {
        let (events, followup) = self.fd.on_beacon_ack(ack, Instant::now());
        *self
            .meta_leader
            .lock()
            .expect("meta leader mutex poisoned") = self.fd.current_leader();
        for event in events {
            self.handle_fd_event(event);
        }
        match followup {
            BeaconFollowup::Immediate => self.send_beacon(),
            BeaconFollowup::Delayed | BeaconFollowup::Normal => {}
        }
    }

    fn handle_fd_event(&mut self, event: FdEvent) {
        match event {
            FdEvent::MasterConnected(node) => {
                pf_info!("stub"; "meta server {} connected", node);
                self.meta_connected = true;
            }
            FdEvent::MasterDisconnected(node) => {
                pf_warn!("stub"; "meta server {} disconnected", node);
                self.meta_connected = false;
            }
            _ => {}
        }
    }

    pub fn is_meta_connected(&self) -> bool {
        self.meta_connected
    }

    /// Main service loop: inbound routing, replica notices, failure
    /// detection, and periodic garbage collection.
    pub async fn serve(&mut self) -> Result<(), ReplicoreError> {
        let mut gc_tick = time::interval(Duration::from_millis(
            self.options.gc_interval_ms.max(1),
        ));
        gc_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut beacon_tick = time::interval(Duration::from_secs(
            self.options.fd_beacon_interval_seconds.max(1),
        ));
        beacon_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut fd_tick = time::interval(Duration::from_secs(
            self.options.fd_check_interval_seconds.max(1),
        ));
        fd_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut config_sync_tick = time::interval(Duration::from_millis(
            self.options.config_sync_interval_ms.max(1),
        ));
        config_sync_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut lb_tick = time::interval(Duration::from_millis(
            self.options.lb_interval_ms.max(1),
        ));
        lb_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                inbound = self.rx_in.recv() => {
                    let Some((from, msg)) = inbound else { break };
                    if let Err(e) = self.on_msg(from, msg).await {
                        pf_error!("stub"; "error routing message: {}", e);
                    }
                },

                notice = self.rx_stub.recv() => {
                    let Some(notice) = notice else { break };
                    self.handle_notice(notice);
                },

                _ = beacon_tick.tick() => {
                    if self.fd.beacon_due(Instant::now()) {
                        self.send_beacon();
                    }
                },

                _ = fd_tick.tick() => {
                    let events = self.fd.check(Instant::now());
                    for event in events {
                        self.handle_fd_event(event);
                    }
                },

                _ = gc_tick.tick() => {
                    match self.gc_once().await {
                        Ok(deleted) if deleted > 0 => {
                            pf_info!("stub";
                                "gc deleted {} shared log segments", deleted);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            pf_error!("stub"; "gc round failed: {}", e);
                        }
                    }
                    self.reclaim_closed_replicas();
                    if let Err(e) = self.purge_error_replica_dirs().await {
                        pf_error!("stub"; "error dir purge failed: {}", e);
                    }
                },

                _ = config_sync_tick.tick() => {
                    self.query_configurations();
                },

                _ = lb_tick.tick() => {
                    self.send_node_report();
                },
            }
        }
        Ok(())
    }
}

/// Moves a replica directory that failed to load out of the way, retrying
/// on (unlikely) suffix collisions.
async fn move_dir_aside(
    root_dir: &Path,
    name: &str,
) -> Result<PathBuf, ReplicoreError> {
    loop {
        let suffix: u32 = rand::thread_rng().gen();
        let target = root_dir.join(format!("{}.{:08x}.err", name, suffix));
        if fs::try_exists(&target).await? {
            continue;
        }
        fs::rename(root_dir.join(name), &target).await?;
        pf_warn!("stub"; "moved bad replica dir {} to {}", name,
                 target.display());
        return Ok(target);
    }
}

#[cfg(test)]
mod stub_tests {
    use super::*;
    use crate::base::PartitionConfiguration;

    fn addr(port: u16) -> NodeAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn test_config() -> ReplicationConfig {
        ReplicationConfig {
            log_pending_max_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn replica_dir_names() {
        let gpid = Gpid::new(2, 7);
        let name = replica_dir_name(gpid, "simple_kv");
        assert_eq!(name, "2.7.simple_kv");
        assert_eq!(
            parse_replica_dir_name(&name),
            Some((gpid, "simple_kv".to_string()))
        );
        assert_eq!(parse_replica_dir_name("2.7.simple_kv.ab12cd34.err"), None);
        assert_eq!(parse_replica_dir_name("slog"), None);
        assert_eq!(parse_replica_dir_name("x.y.simple_kv"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_replica_dir_is_set_aside() -> Result<(), ReplicoreError> {
        let root = tempfile::tempdir()?;
        let bad = root.path().join("1.0.no_such_app");
        std::fs::create_dir_all(&bad)?;

        let (tx_out, _rx_out) = mpsc::unbounded_channel();
        let stub = ReplicaStub::new_and_setup(
            addr(4101),
            root.path(),
            vec![addr(3101)],
            test_config(),
            tx_out,
        )
        .await?;
        assert_eq!(stub.replica_count(), 0);

        // original dir is gone, an .err sibling exists in its place
        assert!(!bad.exists());
        let set_aside = std::fs::read_dir(root.path())?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.starts_with("1.0.no_such_app.") && n.ends_with(".err"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(set_aside, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_dir_purged_after_hold() -> Result<(), ReplicoreError> {
        let root = tempfile::tempdir()?;
        let bad = root.path().join("1.0.no_such_app");
        std::fs::create_dir_all(&bad)?;

        let (tx_out, _rx_out) = mpsc::unbounded_channel();
        let stub = ReplicaStub::new_and_setup(
            addr(4103),
            root.path(),
            vec![addr(3103)],
            ReplicationConfig {
                gc_disk_error_replica_interval_seconds: 0,
                log_pending_max_ms: 5,
                ..Default::default()
            },
            tx_out,
        )
        .await?;

        // load set the corrupt dir aside; a zero hold purges it right away
        assert_eq!(stub.purge_error_replica_dirs().await?, 1);
        let leftover = std::fs::read_dir(root.path())?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.ends_with(".err"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftover, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_meta_traffic() -> Result<(), ReplicoreError> {
        let root = tempfile::tempdir()?;
        let meta = addr(3104);
        let me = addr(4104);
        let (tx_out, mut rx_out) = mpsc::unbounded_channel();
        let stub = ReplicaStub::new_and_setup(
            me,
            root.path(),
            vec![meta],
            test_config(),
            tx_out,
        )
        .await?;

        stub.query_configurations();
        stub.send_node_report();

        match rx_out.try_recv() {
            Ok((target, ReplicaMsg::QueryConfigurationByNode { node })) => {
                assert_eq!(target, meta);
                assert_eq!(node, me);
            }
            other => panic!("unexpected message {:?}", other),
        }
        match rx_out.try_recv() {
            Ok((target, ReplicaMsg::NodeReport(report))) => {
                assert_eq!(target, meta);
                assert_eq!(report.node, me);
                assert!(report.replicas.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assign_primary_flows_to_meta() -> Result<(), ReplicoreError> {
        let root = tempfile::tempdir()?;
        let meta = addr(3102);
        let me = addr(4102);
        let (tx_out, mut rx_out) = mpsc::unbounded_channel();

        let mut stub = ReplicaStub::new_and_setup(
            me,
            root.path(),
            vec![meta],
            test_config(),
            tx_out,
        )
        .await?;

        let gpid = Gpid::new(1, 0);
        let proposal = ConfigProposalRequest {
            kind: ConfigType::AssignPrimary,
            node: me,
            config: PartitionConfiguration {
                gpid,
                ballot: 0,
                max_replica_count: 3,
                primary: None,
                secondaries: Vec::new(),
                last_committed_decree: 0,
                app_type: "simple_kv".into(),
            },
        };
        stub.on_msg(meta, ReplicaMsg::ConfigProposal(proposal)).await?;
        assert_eq!(stub.replica_count(), 1);

        // the freshly-created replica turns the proposal into an
        // update-configuration request for the meta-server
        let (target, msg) = tokio::time::timeout(
            Duration::from_secs(5),
            rx_out.recv(),
        )
        .await
        .expect("timely meta request")
        .expect("channel open");
        assert_eq!(target, meta);
        match msg {
            ReplicaMsg::UpdateConfiguration(request) => {
                assert_eq!(request.kind, ConfigType::AssignPrimary);
                assert_eq!(request.config.ballot, 1);
                assert_eq!(request.config.primary, Some(me));
            }
            other => panic!("unexpected message {:?}", other),
        }
        Ok(())
    }
}
