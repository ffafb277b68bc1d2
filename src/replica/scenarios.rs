//! End-to-end protocol scenarios driving a small group of replicas directly
//! (the test acts as both the network and the meta-server).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use crate::app::SimpleKvApp;
use crate::base::{
    ConfigType, Decree, ErrCode, Gpid, LearnerStatus, NodeAddr,
    PartitionConfiguration, PartitionStatus, ReplicationConfig,
};
use crate::messages::{
    ConfigProposalRequest, ConfigUpdateResponse, LearnType, ReplicaMsg,
};
use crate::replica::{Mutation, MutationHeader, Replica, ReplicaEvent};
use crate::utils::ReplicoreError;
use crate::wal::{LogOptions, MutationLog};

use tokio::sync::mpsc;

const APP_TYPE: &str = "simple_kv";
const KV_WRITE_RPC: u32 = 1;

struct TestNode {
    addr: NodeAddr,
    replica: Replica,
    rx_out: mpsc::UnboundedReceiver<(NodeAddr, ReplicaMsg)>,
    rx_stub: mpsc::UnboundedReceiver<crate::replica::StubNotice>,
}

struct TestCluster {
    meta: NodeAddr,
    gpid: Gpid,
    nodes: Vec<TestNode>,
    meta_inbox: Vec<(NodeAddr, ReplicaMsg)>,
}

fn addr(port: u16) -> NodeAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid address")
}

fn put_payload(key: &str, value: &str) -> Vec<u8> {
    SimpleKvApp::encode_put(key, value)
}

fn kv_value(replica: &Replica, key: &str) -> Option<String> {
    let reply = replica
        .app()
        .query(&SimpleKvApp::encode_get(key))
        .expect("query should succeed");
    match rmp_serde::from_slice(&reply).expect("valid query reply") {
        crate::app::KvResult::Get { value } => value,
    }
}

impl TestCluster {
    async fn new(
        root: &Path,
        meta: NodeAddr,
        gpid: Gpid,
        node_addrs: &[NodeAddr],
        options: ReplicationConfig,
    ) -> Result<TestCluster, ReplicoreError> {
        let options = Arc::new(options);
        let mut nodes = Vec::new();
        for node_addr in node_addrs {
            let node_dir = root.join(format!("node-{}", node_addr.port()));
            let shared_log = Arc::new(
                MutationLog::open(
                    &node_dir.join("slog"),
                    LogOptions::shared(&options),
                )
                .await?,
            );
            shared_log.start_write_service(
                BTreeMap::new(),
                options.staleness_for_commit as u32,
            )?;

            let (tx_out, rx_out) = mpsc::unbounded_channel();
            let (tx_stub, rx_stub) = mpsc::unbounded_channel();
            let replica = Replica::create(
                gpid,
                APP_TYPE,
                node_dir.join(crate::stub::replica_dir_name(gpid, APP_TYPE)),
                *node_addr,
                options.clone(),
                shared_log,
                tx_out,
                tx_stub,
                Arc::new(StdMutex::new(meta)),
            )
            .await?;
            nodes.push(TestNode {
                addr: *node_addr,
                replica,
                rx_out,
                rx_stub,
            });
        }
        Ok(TestCluster {
            meta,
            gpid,
            nodes,
            meta_inbox: Vec::new(),
        })
    }

    fn node(&mut self, addr: NodeAddr) -> &mut TestNode {
        self.nodes
            .iter_mut()
            .find(|n| n.addr == addr)
            .expect("known node")
    }

    fn replica(&mut self, addr: NodeAddr) -> &mut Replica {
        &mut self.node(addr).replica
    }

    fn kill(&mut self, addr: NodeAddr) {
        self.nodes.retain(|n| n.addr != addr);
    }

    /// Pulls everything a node has sent so far.
    fn take_outbound(
        &mut self,
        addr: NodeAddr,
    ) -> Vec<(NodeAddr, ReplicaMsg)> {
        let node = self.node(addr);
        let mut out = Vec::new();
        while let Ok(pair) = node.rx_out.try_recv() {
            out.push(pair);
        }
        out
    }

    /// Runs flush/ack/event/delivery rounds until the cluster goes quiet.
    /// Messages addressed to the meta-server pile up in `meta_inbox`.
    async fn settle(&mut self) -> Result<(), ReplicoreError> {
        for _ in 0..64 {
            let mut active = false;

            for node in &mut self.nodes {
                node.replica.shared_log.flush().await?;
                if let Some(private_log) = &node.replica.private_log {
                    private_log.flush().await?;
                }
                if node.replica.has_pending_log_acks() {
                    active = true;
                    node.replica.pump_log_acks().await?;
                }
                for event in node.replica.drain_self_events() {
                    if matches!(event, ReplicaEvent::Close) {
                        continue;
                    }
                    active = true;
                    node.replica.handle_event(event).await?;
                }
                while node.rx_stub.try_recv().is_ok() {}
            }

            let mut deliveries = Vec::new();
            for node in &mut self.nodes {
                while let Ok((target, msg)) = node.rx_out.try_recv() {
                    deliveries.push((node.addr, target, msg));
                }
            }
            if !deliveries.is_empty() {
                active = true;
            }
            for (from, target, msg) in deliveries {
                if target == self.meta {
                    self.meta_inbox.push((from, msg));
                } else if let Some(node) =
                    self.nodes.iter_mut().find(|n| n.addr == target)
                {
                    node.replica.handle_msg(from, msg).await?;
                }
                // messages to killed nodes vanish, like the network would
            }

            if !active {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Plays the meta-server: confirms every pending configuration update
    /// verbatim.
    async fn meta_confirm(&mut self) -> Result<(), ReplicoreError> {
        let inbox = std::mem::take(&mut self.meta_inbox);
        for (from, msg) in inbox {
            if let ReplicaMsg::UpdateConfiguration(request) = msg {
                let resp = ConfigUpdateResponse {
                    err: ErrCode::Ok,
                    config: request.config,
                };
                let meta = self.meta;
                self.node(from)
                    .replica
                    .handle_msg(
                        meta,
                        ReplicaMsg::UpdateConfigurationReply(resp),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn settle_with_meta(&mut self) -> Result<(), ReplicoreError> {
        for _ in 0..8 {
            self.settle().await?;
            if self.meta_inbox.is_empty() {
                return Ok(());
            }
            self.meta_confirm().await?;
        }
        Ok(())
    }

    fn group_config(
        &self,
        ballot: u64,
        primary: Option<NodeAddr>,
        secondaries: Vec<NodeAddr>,
    ) -> PartitionConfiguration {
        PartitionConfiguration {
            gpid: self.gpid,
            ballot,
            max_replica_count: 3,
            primary,
            secondaries,
            last_committed_decree: 0,
            app_type: APP_TYPE.into(),
        }
    }

    /// Bootstraps `addr` into the primary role through the real proposal +
    /// meta confirmation round-trip. The confirmed ballot is `ballot + 1`.
    async fn bootstrap_primary(
        &mut self,
        addr: NodeAddr,
        proposal_ballot: u64,
        secondaries: Vec<NodeAddr>,
    ) -> Result<(), ReplicoreError> {
        let config =
            self.group_config(proposal_ballot, None, secondaries.clone());
        let proposal = ConfigProposalRequest {
            kind: ConfigType::AssignPrimary,
            node: addr,
            config,
        };
        self.replica(addr).on_config_proposal(proposal);
        self.settle_with_meta().await?;

        // secondaries adopt the confirmed configuration as if config-synced
        // while their inactivity is transient
        let confirmed = self.group_config(
            proposal_ballot + 1,
            Some(addr),
            secondaries.clone(),
        );
        for secondary in secondaries {
            let replica = self.replica(secondary);
            replica.set_inactive_state_transient(true);
            assert!(replica.update_configuration(&confirmed));
            assert_eq!(replica.status(), PartitionStatus::Secondary);
        }

        assert_eq!(self.replica(addr).status(), PartitionStatus::Primary);
        assert_eq!(self.replica(addr).ballot(), proposal_ballot + 1);
        Ok(())
    }

    /// Issues one client put through the primary and settles the group.
    async fn client_put(
        &mut self,
        primary: NodeAddr,
        key: &str,
        value: &str,
        request_id: u64,
    ) -> Result<(), ReplicoreError> {
        let code = self.replica(primary).on_client_write(
            put_payload(key, value),
            KV_WRITE_RPC,
            request_id,
        );
        assert_eq!(code, ErrCode::Ok);
        self.settle().await
    }

    /// Pushes committed state to the group the way the timer would.
    async fn group_check_round(
        &mut self,
        primary: NodeAddr,
    ) -> Result<(), ReplicoreError> {
        self.replica(primary).broadcast_group_check();
        self.settle().await
    }

    /// Seeds a replica's app with puts for decrees `1..=decree` outside the
    /// protocol, modeling state carried over from an earlier life.
    fn seed_app(&mut self, addr: NodeAddr, decree: Decree) {
        let gpid = self.gpid;
        let replica = self.replica(addr);
        for d in 1..=decree {
            let mu = Mutation::new(
                MutationHeader {
                    gpid,
                    ballot: 1,
                    decree: d,
                    log_offset: 0,
                    last_committed_decree: d - 1,
                    timestamp_ms: 0,
                    client_request_id: d,
                },
                KV_WRITE_RPC,
                put_payload(&format!("k{}", d), &format!("v{}", d)),
            );
            replica
                .app
                .write_internal(&mu)
                .expect("seeding app state");
        }
    }
}

fn test_options() -> ReplicationConfig {
    ReplicationConfig {
        log_pending_max_ms: 5,
        ..Default::default()
    }
}

// Scenario: single-partition write path with one primary and two
// secondaries at quorum two.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_partition_write_path() -> Result<(), ReplicoreError> {
    let root = tempfile::tempdir()?;
    let meta = addr(5100);
    let (p, s1, s2) = (addr(5101), addr(5102), addr(5103));
    let mut cluster = TestCluster::new(
        root.path(),
        meta,
        Gpid::new(1, 0),
        &[p, s1, s2],
        test_options(),
    )
    .await?;

    cluster.bootstrap_primary(p, 0, vec![s1, s2]).await?;
    assert_eq!(cluster.replica(p).write_quorum(), 2);

    cluster.client_put(p, "k1", "a", 1).await?;
    cluster.client_put(p, "k2", "b", 2).await?;
    cluster.client_put(p, "k3", "c", 3).await?;
    cluster.group_check_round(p).await?;

    for node_addr in [p, s1, s2] {
        let replica = cluster.replica(node_addr);
        assert_eq!(replica.last_committed_decree(), 3);
        assert_eq!(replica.app().last_committed_decree(), 3);
        assert!(replica.app().last_durable_decree() <= 3);
        assert_eq!(kv_value(replica, "k1").as_deref(), Some("a"));
        assert_eq!(kv_value(replica, "k2").as_deref(), Some("b"));
        assert_eq!(kv_value(replica, "k3").as_deref(), Some("c"));
    }

    // writes on a non-primary are refused outright
    let code = cluster.replica(s1).on_client_write(
        put_payload("k4", "d"),
        KV_WRITE_RPC,
        4,
    );
    assert_eq!(code, ErrCode::InvalidState);
    Ok(())
}

// Scenario: primary fails at ballot 5 / decree 10; a secondary is upgraded
// to primary at ballot 6 and the group keeps accepting writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn primary_failover() -> Result<(), ReplicoreError> {
    let root = tempfile::tempdir()?;
    let meta = addr(5200);
    let (p, s1, s2) = (addr(5201), addr(5202), addr(5203));
    let mut cluster = TestCluster::new(
        root.path(),
        meta,
        Gpid::new(1, 0),
        &[p, s1, s2],
        test_options(),
    )
    .await?;

    cluster.bootstrap_primary(p, 4, vec![s1, s2]).await?;
    assert_eq!(cluster.replica(p).ballot(), 5);

    for d in 1..=10u64 {
        cluster
            .client_put(p, &format!("k{}", d), &format!("v{}", d), d)
            .await?;
    }
    cluster.group_check_round(p).await?;
    for node_addr in [p, s1, s2] {
        assert_eq!(cluster.replica(node_addr).last_committed_decree(), 10);
    }

    cluster.kill(p);

    // the meta-server upgrades s1, with the dead primary already dropped
    // from the authoritative configuration
    let proposal = ConfigProposalRequest {
        kind: ConfigType::UpgradeToPrimary,
        node: s1,
        config: cluster.group_config(5, None, vec![s1, s2]),
    };
    cluster.replica(s1).on_config_proposal(proposal);
    cluster.settle_with_meta().await?;

    let replica = cluster.replica(s1);
    assert_eq!(replica.status(), PartitionStatus::Primary);
    assert_eq!(replica.ballot(), 6);

    // the first group check carries ballot 6 to the other secondary
    cluster.group_check_round(s1).await?;
    assert_eq!(cluster.replica(s2).ballot(), 6);
    assert_eq!(
        cluster.replica(s2).status(),
        PartitionStatus::Secondary
    );

    // writes resume at decree 11 with quorum {s1, s2}
    cluster.client_put(s1, "k11", "v11", 11).await?;
    assert_eq!(cluster.replica(s1).last_committed_decree(), 11);
    cluster.group_check_round(s1).await?;
    assert_eq!(cluster.replica(s2).last_committed_decree(), 11);
    assert_eq!(kv_value(cluster.replica(s2), "k11").as_deref(), Some("v11"));
    Ok(())
}

// Scenario: a learner whose app stopped at decree 7 catches up from the
// primary's mutation cache (committed decree 9, window floor below 8).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn learner_with_mutation_cache() -> Result<(), ReplicoreError> {
    let root = tempfile::tempdir()?;
    let meta = addr(5300);
    let (p, s2, n) = (addr(5301), addr(5302), addr(5303));
    let mut cluster = TestCluster::new(
        root.path(),
        meta,
        Gpid::new(1, 0),
        &[p, s2, n],
        test_options(),
    )
    .await?;

    cluster.bootstrap_primary(p, 0, vec![s2]).await?;
    for d in 1..=9u64 {
        cluster
            .client_put(p, &format!("k{}", d), &format!("v{}", d), d)
            .await?;
    }
    assert_eq!(cluster.replica(p).last_committed_decree(), 9);
    assert!(cluster.replica(p).prepare_list.min_decree() <= 5);

    // the newcomer carries app state through decree 7 from an earlier life
    cluster.seed_app(n, 7);

    // meta asks the primary to add n; the add-learner trigger flows out
    let proposal = ConfigProposalRequest {
        kind: ConfigType::AddSecondary,
        node: n,
        config: cluster.group_config(1, Some(p), vec![s2]),
    };
    cluster.replica(p).on_config_proposal(proposal);
    let add_learner = cluster
        .take_outbound(p)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::AddLearner(req) if target == n => Some(req),
            _ => None,
        })
        .expect("add-learner trigger");

    cluster.replica(n).handle_msg(p, ReplicaMsg::AddLearner(add_learner)).await?;
    assert_eq!(
        cluster.replica(n).status(),
        PartitionStatus::PotentialSecondary
    );

    // intercept the learn request and response to check the classification
    let learn_req = cluster
        .take_outbound(n)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::Learn(req) if target == p => Some(req),
            _ => None,
        })
        .expect("learn request");
    assert_eq!(learn_req.last_committed_decree_in_app, 7);

    cluster
        .replica(p)
        .handle_msg(n, ReplicaMsg::Learn(learn_req))
        .await?;
    let learn_resp = cluster
        .take_outbound(p)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::LearnReply(resp) if target == n => Some(resp),
            _ => None,
        })
        .expect("learn response");

    assert_eq!(learn_resp.err, ErrCode::Ok);
    assert_eq!(learn_resp.learn_type, LearnType::Cache);
    assert_eq!(learn_resp.state.from_decree_excluded, 7); // learn_start = 8
    assert_eq!(learn_resp.prepare_start_decree, Some(10));
    let cached = Mutation::parse_all(&learn_resp.state.meta[0])?;
    assert_eq!(
        cached.iter().map(|m| m.header.decree).collect::<Vec<_>>(),
        vec![8, 9]
    );

    cluster
        .replica(n)
        .handle_msg(p, ReplicaMsg::LearnReply(learn_resp))
        .await?;
    let replica = cluster.replica(n);
    assert_eq!(replica.last_committed_decree(), 9);
    assert_eq!(replica.app().last_committed_decree(), 9);
    assert_eq!(
        replica.potential_secondary_states.learning_status,
        LearnerStatus::WithPrepare
    );

    // let the loop run to completion: learner converges and is upgraded
    cluster.settle_with_meta().await?;
    cluster.group_check_round(p).await?;
    cluster.settle_with_meta().await?;
    cluster.group_check_round(p).await?;
    assert_eq!(cluster.replica(n).status(), PartitionStatus::Secondary);
    assert_eq!(kv_value(cluster.replica(n), "k9").as_deref(), Some("v9"));
    Ok(())
}

// Scenario: the learner is too far behind the prepare window and receives
// an app checkpoint instead.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn learner_with_checkpoint() -> Result<(), ReplicoreError> {
    let root = tempfile::tempdir()?;
    let meta = addr(5400);
    let (p, s2, n) = (addr(5401), addr(5402), addr(5403));
    let options = ReplicationConfig {
        // a tiny window so decree 3 falls far below min_decree
        max_mutation_count_in_prepare_list: 2,
        staleness_for_commit: 2,
        log_pending_max_ms: 5,
        ..Default::default()
    };
    let mut cluster = TestCluster::new(
        root.path(),
        meta,
        Gpid::new(1, 0),
        &[p, s2, n],
        options,
    )
    .await?;

    cluster.bootstrap_primary(p, 0, vec![s2]).await?;
    for d in 1..=9u64 {
        cluster
            .client_put(p, &format!("k{}", d), &format!("v{}", d), d)
            .await?;
    }
    assert_eq!(cluster.replica(p).prepare_list.min_decree(), 8);
    cluster.replica(p).app.checkpoint().await?;

    cluster.seed_app(n, 2);

    let proposal = ConfigProposalRequest {
        kind: ConfigType::AddSecondary,
        node: n,
        config: cluster.group_config(1, Some(p), vec![s2]),
    };
    cluster.replica(p).on_config_proposal(proposal);
    let add_learner = cluster
        .take_outbound(p)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::AddLearner(req) if target == n => Some(req),
            _ => None,
        })
        .expect("add-learner trigger");
    cluster
        .replica(n)
        .handle_msg(p, ReplicaMsg::AddLearner(add_learner))
        .await?;

    let learn_req = cluster
        .take_outbound(n)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::Learn(req) if target == p => Some(req),
            _ => None,
        })
        .expect("learn request");
    assert_eq!(learn_req.last_committed_decree_in_app, 2);

    cluster
        .replica(p)
        .handle_msg(n, ReplicaMsg::Learn(learn_req))
        .await?;
    let learn_resp = cluster
        .take_outbound(p)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::LearnReply(resp) if target == n => Some(resp),
            _ => None,
        })
        .expect("learn response");

    assert_eq!(learn_resp.err, ErrCode::Ok);
    assert_eq!(learn_resp.learn_type, LearnType::App);
    assert!(!learn_resp.state.files.is_empty());
    let expected_base =
        cluster.replica(p).app().data_dir().display().to_string();
    assert_eq!(learn_resp.base_local_dir, expected_base);

    cluster
        .replica(n)
        .handle_msg(p, ReplicaMsg::LearnReply(learn_resp))
        .await?;
    assert!(cluster.replica(n).app().last_committed_decree() >= 2);
    assert_eq!(cluster.replica(n).app().last_committed_decree(), 9);

    // loop to convergence and promotion
    cluster.settle_with_meta().await?;
    cluster.group_check_round(p).await?;
    cluster.settle_with_meta().await?;
    cluster.group_check_round(p).await?;
    assert_eq!(cluster.replica(n).status(), PartitionStatus::Secondary);
    Ok(())
}

// Scenario: the primary changes mid-learn and issues a fresh signature;
// the old epoch is discarded cleanly.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_during_learn() -> Result<(), ReplicoreError> {
    let root = tempfile::tempdir()?;
    let meta = addr(5500);
    let (p, s1, n) = (addr(5501), addr(5502), addr(5503));
    let mut cluster = TestCluster::new(
        root.path(),
        meta,
        Gpid::new(1, 0),
        &[p, s1, n],
        test_options(),
    )
    .await?;

    cluster.bootstrap_primary(p, 4, vec![s1]).await?;
    for d in 1..=3u64 {
        cluster
            .client_put(p, &format!("k{}", d), &format!("v{}", d), d)
            .await?;
    }

    // start n learning under the old primary, leaving its learn request
    // stranded in flight
    let proposal = ConfigProposalRequest {
        kind: ConfigType::AddSecondary,
        node: n,
        config: cluster.group_config(5, Some(p), vec![s1]),
    };
    cluster.replica(p).on_config_proposal(proposal);
    let add_learner = cluster
        .take_outbound(p)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::AddLearner(req) if target == n => Some(req),
            _ => None,
        })
        .expect("add-learner trigger");
    cluster
        .replica(n)
        .handle_msg(p, ReplicaMsg::AddLearner(add_learner))
        .await?;
    let old_signature = cluster
        .replica(n)
        .potential_secondary_states
        .learning_signature
        .expect("learning epoch started");
    assert!(
        cluster
            .replica(n)
            .potential_secondary_states
            .learning_round_is_running
    );
    cluster
        .replica(n)
        .potential_secondary_states
        .learning_status = LearnerStatus::WithPrepareTransient;
    let _stranded = cluster.take_outbound(n);

    // primary dies; s1 takes over at ballot 6
    cluster.kill(p);
    let proposal = ConfigProposalRequest {
        kind: ConfigType::UpgradeToPrimary,
        node: s1,
        config: cluster.group_config(5, None, vec![s1]),
    };
    cluster.replica(s1).on_config_proposal(proposal);
    cluster.settle_with_meta().await?;
    assert_eq!(cluster.replica(s1).status(), PartitionStatus::Primary);
    assert_eq!(cluster.replica(s1).ballot(), 6);

    // the new primary re-adds n, minting a new signature
    let proposal = ConfigProposalRequest {
        kind: ConfigType::AddSecondary,
        node: n,
        config: cluster.group_config(6, Some(s1), vec![]),
    };
    cluster.replica(s1).on_config_proposal(proposal);
    let add_learner = cluster
        .take_outbound(s1)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::AddLearner(req) if target == n => Some(req),
            _ => None,
        })
        .expect("fresh add-learner trigger");
    let new_signature =
        add_learner.config.learner_signature.expect("new signature");
    assert_ne!(new_signature, old_signature);

    cluster
        .replica(n)
        .handle_msg(s1, ReplicaMsg::AddLearner(add_learner))
        .await?;

    // the old epoch is fully replaced: new signature, clean status, and a
    // learn request addressed to the new primary
    let replica = cluster.replica(n);
    assert_eq!(replica.ballot(), 6);
    assert_eq!(
        replica.potential_secondary_states.learning_signature,
        Some(new_signature)
    );
    assert!(replica.potential_secondary_states.learning_round_is_running);
    let learn_req = cluster
        .take_outbound(n)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::Learn(req) => Some((target, req)),
            _ => None,
        })
        .expect("fresh learn request");
    assert_eq!(learn_req.0, s1);
    assert_eq!(learn_req.1.signature, new_signature);

    // and the new epoch converges
    cluster
        .replica(s1)
        .handle_msg(n, ReplicaMsg::Learn(learn_req.1))
        .await?;
    cluster.settle_with_meta().await?;
    cluster.group_check_round(s1).await?;
    cluster.settle_with_meta().await?;
    cluster.group_check_round(s1).await?;
    assert_eq!(cluster.replica(n).status(), PartitionStatus::Secondary);
    Ok(())
}

// A remove request at the current ballot must not tear down a replica that
// was re-added as a learner after the removal was issued.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_remove_ignored_while_learning() -> Result<(), ReplicoreError> {
    let root = tempfile::tempdir()?;
    let meta = addr(5600);
    let (p, n) = (addr(5601), addr(5602));
    let mut cluster = TestCluster::new(
        root.path(),
        meta,
        Gpid::new(1, 0),
        &[p, n],
        test_options(),
    )
    .await?;

    cluster.bootstrap_primary(p, 0, vec![]).await?;
    let proposal = ConfigProposalRequest {
        kind: ConfigType::AddSecondary,
        node: n,
        config: cluster.group_config(1, Some(p), vec![]),
    };
    cluster.replica(p).on_config_proposal(proposal);
    let add_learner = cluster
        .take_outbound(p)
        .into_iter()
        .find_map(|(target, msg)| match msg {
            ReplicaMsg::AddLearner(req) if target == n => Some(req),
            _ => None,
        })
        .expect("add-learner trigger");
    cluster
        .replica(n)
        .handle_msg(p, ReplicaMsg::AddLearner(add_learner))
        .await?;
    assert_eq!(
        cluster.replica(n).status(),
        PartitionStatus::PotentialSecondary
    );

    // a delayed removal from before the re-add, at the same ballot
    let stale_remove = crate::base::ReplicaConfiguration {
        gpid: cluster.gpid,
        ballot: 1,
        primary: Some(p),
        status: PartitionStatus::Inactive,
        learner_signature: None,
    };
    cluster.replica(n).on_remove(stale_remove);
    assert_eq!(
        cluster.replica(n).status(),
        PartitionStatus::PotentialSecondary
    );

    // a removal under a newer ballot does apply
    let real_remove = crate::base::ReplicaConfiguration {
        gpid: cluster.gpid,
        ballot: 2,
        primary: Some(p),
        status: PartitionStatus::Inactive,
        learner_signature: None,
    };
    cluster.replica(n).on_remove(real_remove);
    assert_eq!(cluster.replica(n).status(), PartitionStatus::Inactive);
    Ok(())
}
