//! Lease-based bidirectional failure detection between replica servers and
//! the meta-server group. The worker side beacons the believed meta leader
//! and rotates through the group on failure; the master side registers
//! workers on first beacon and evicts them after the grace window.
//!
//! All entry points take `now` explicitly so liveness math is testable
//! under a paused clock.

use crate::base::{NodeAddr, ReplicationConfig};
use crate::messages::{Beacon, BeaconAck};

use std::collections::HashMap;

use rand::Rng;

use tokio::time::{Duration, Instant};

/// Detector timing knobs; invariants `beacon < lease < grace` are enforced
/// by `ReplicationConfig::sanity_check`.
#[derive(Debug, Clone)]
pub struct FdOptions {
    pub check_interval: Duration,
    pub beacon_interval: Duration,
    pub lease: Duration,
    pub grace: Duration,
}

impl FdOptions {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        FdOptions {
            check_interval: Duration::from_secs(
                config.fd_check_interval_seconds,
            ),
            beacon_interval: Duration::from_secs(
                config.fd_beacon_interval_seconds,
            ),
            lease: Duration::from_secs(config.fd_lease_seconds),
            grace: Duration::from_secs(config.fd_grace_seconds),
        }
    }
}

/// Liveness transitions surfaced to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdEvent {
    MasterConnected(NodeAddr),
    MasterDisconnected(NodeAddr),
    WorkerConnected(NodeAddr),
    WorkerDisconnected(NodeAddr),
}

/// What the worker should do after processing a beacon ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconFollowup {
    /// Wait for the regular beacon interval.
    Normal,
    /// The leader hint changed and is probably right: beacon immediately.
    Immediate,
    /// Rotated to the next group member; wait a moment to avoid flooding.
    Delayed,
}

/// Worker-side detector: one replica server tracking the meta group.
pub struct FailureDetector {
    me: NodeAddr,
    opts: FdOptions,
    meta_servers: Vec<NodeAddr>,
    leader_index: usize,
    last_send: Option<Instant>,
    last_ack: Option<Instant>,
    connected: bool,
}

impl FailureDetector {
    pub fn new(
        me: NodeAddr,
        meta_servers: Vec<NodeAddr>,
        opts: FdOptions,
    ) -> Self {
        assert!(!meta_servers.is_empty());
        let leader_index = rand::thread_rng().gen_range(0..meta_servers.len());
        FailureDetector {
            me,
            opts,
            meta_servers,
            leader_index,
            last_send: None,
            last_ack: None,
            connected: false,
        }
    }

    pub fn current_leader(&self) -> NodeAddr {
        self.meta_servers[self.leader_index]
    }

    /// Whether the lease from the current master is still valid.
    pub fn is_connected(&self, now: Instant) -> bool {
        self.connected
            && self
                .last_ack
                .map(|t| now.duration_since(t) <= self.opts.lease)
                .unwrap_or(false)
    }

    /// True when the regular beacon interval elapsed.
    pub fn beacon_due(&self, now: Instant) -> bool {
        self.last_send
            .map(|t| now.duration_since(t) >= self.opts.beacon_interval)
            .unwrap_or(true)
    }

    /// Produces the next beacon toward the current leader.
    pub fn make_beacon(&mut self, now: Instant, time_ms: u64) -> Beacon {
        self.last_send = Some(now);
        Beacon {
            from_addr: self.me,
            to_addr: self.current_leader(),
            time_ms,
        }
    }

    fn rotate_leader(&mut self) -> bool {
        if self.meta_servers.len() <= 1 {
            return false;
        }
        self.leader_index = (self.leader_index + 1) % self.meta_servers.len();
        true
    }

    /// Processes the outcome of a beacon: `None` means the transport failed.
    /// Returns liveness events plus how soon to beacon again.
    pub fn on_beacon_ack(
        &mut self,
        ack: Option<BeaconAck>,
        now: Instant,
    ) -> (Vec<FdEvent>, BeaconFollowup) {
        let mut events = Vec::new();

        let Some(ack) = ack else {
            // transport failure: try the next group member, but not
            // immediately, to avoid flooding a half-dead group
            self.rotate_leader();
            return (events, BeaconFollowup::Delayed);
        };

        if !ack.allowed {
            self.rotate_leader();
            return (events, BeaconFollowup::Delayed);
        }

        if ack.is_master {
            self.last_ack = Some(now);
            if !self.connected {
                self.connected = true;
                events.push(FdEvent::MasterConnected(ack.this_node));
            }
            (events, BeaconFollowup::Normal)
        } else if let Some(primary) = ack.primary_node {
            if primary != ack.this_node {
                if let Some(index) =
                    self.meta_servers.iter().position(|m| *m == primary)
                {
                    self.leader_index = index;
                }
                // the hint is probably right, no reason to wait
                (events, BeaconFollowup::Immediate)
            } else {
                (events, BeaconFollowup::Normal)
            }
        } else {
            self.rotate_leader();
            (events, BeaconFollowup::Delayed)
        }
    }

    /// Periodic liveness evaluation; fires the disconnect callback once the
    /// grace window passes with no ack.
    pub fn check(&mut self, now: Instant) -> Vec<FdEvent> {
        let mut events = Vec::new();
        if self.connected {
            let expired = self
                .last_ack
                .map(|t| now.duration_since(t) > self.opts.grace)
                .unwrap_or(true);
            if expired {
                self.connected = false;
                events.push(FdEvent::MasterDisconnected(
                    self.current_leader(),
                ));
            }
        }
        events
    }
}

/// Master-side detector: the meta leader tracking its replica servers.
pub struct MetaFailureDetector {
    me: NodeAddr,
    opts: FdOptions,
    is_leader: bool,
    /// The leader to redirect workers to when we are not it.
    leader_hint: Option<NodeAddr>,
    workers: HashMap<NodeAddr, Instant>,
}

impl MetaFailureDetector {
    pub fn new(me: NodeAddr, is_leader: bool, opts: FdOptions) -> Self {
        MetaFailureDetector {
            me,
            opts,
            is_leader,
            leader_hint: None,
            workers: HashMap::new(),
        }
    }

    pub fn set_leader(&mut self, is_leader: bool, hint: Option<NodeAddr>) {
        self.is_leader = is_leader;
        self.leader_hint = hint;
    }

    pub fn workers(&self) -> impl Iterator<Item = &NodeAddr> {
        self.workers.keys()
    }

    /// Registers/refreshes the worker and builds its ack.
    pub fn on_beacon(
        &mut self,
        beacon: &Beacon,
        now: Instant,
    ) -> (BeaconAck, Option<FdEvent>) {
        let mut event = None;
        if self.is_leader {
            if self
                .workers
                .insert(beacon.from_addr, now)
                .is_none()
            {
                event = Some(FdEvent::WorkerConnected(beacon.from_addr));
            }
        }

        let ack = BeaconAck {
            time_ms: beacon.time_ms,
            this_node: self.me,
            primary_node: if self.is_leader {
                Some(self.me)
            } else {
                self.leader_hint
            },
            is_master: self.is_leader,
            allowed: true,
        };
        (ack, event)
    }

    /// Evicts workers that stayed silent past the grace window.
    pub fn check(&mut self, now: Instant) -> Vec<FdEvent> {
        let grace = self.opts.grace;
        let mut gone = Vec::new();
        self.workers.retain(|node, last| {
            if now.duration_since(*last) > grace {
                gone.push(FdEvent::WorkerDisconnected(*node));
                false
            } else {
                true
            }
        });
        gone
    }
}

#[cfg(test)]
mod fd_tests {
    use super::*;

    fn addr(port: u16) -> NodeAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn test_opts() -> FdOptions {
        FdOptions {
            check_interval: Duration::from_secs(2),
            beacon_interval: Duration::from_secs(3),
            lease: Duration::from_secs(9),
            grace: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_lease_and_grace_window() {
        let meta = addr(3001);
        let worker = addr(4001);
        let mut fd =
            FailureDetector::new(worker, vec![meta], test_opts());

        let now = Instant::now();
        assert!(fd.beacon_due(now));
        let beacon = fd.make_beacon(now, 0);
        assert_eq!(beacon.to_addr, meta);

        let ack = BeaconAck {
            time_ms: 0,
            this_node: meta,
            primary_node: Some(meta),
            is_master: true,
            allowed: true,
        };
        let (events, followup) = fd.on_beacon_ack(Some(ack), now);
        assert_eq!(events, vec![FdEvent::MasterConnected(meta)]);
        assert_eq!(followup, BeaconFollowup::Normal);
        assert!(fd.is_connected(now));

        // inside the lease window: still connected, no disconnect
        tokio::time::advance(Duration::from_secs(8)).await;
        let now = Instant::now();
        assert!(fd.is_connected(now));
        assert!(fd.check(now).is_empty());

        // past lease but inside grace: lease gone, no disconnect callback
        tokio::time::advance(Duration::from_secs(2)).await;
        let now = Instant::now();
        assert!(!fd.is_connected(now));
        assert!(fd.check(now).is_empty());

        // past grace: disconnect fires exactly once
        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        assert_eq!(fd.check(now), vec![FdEvent::MasterDisconnected(meta)]);
        assert!(fd.check(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_rotates_on_transport_failure() {
        let metas = vec![addr(3001), addr(3002), addr(3003)];
        let mut fd =
            FailureDetector::new(addr(4001), metas.clone(), test_opts());

        let before = fd.current_leader();
        let (events, followup) = fd.on_beacon_ack(None, Instant::now());
        assert!(events.is_empty());
        assert_eq!(followup, BeaconFollowup::Delayed);
        assert_ne!(fd.current_leader(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_adopts_leader_hint() {
        let metas = vec![addr(3001), addr(3002)];
        let mut fd =
            FailureDetector::new(addr(4001), metas.clone(), test_opts());

        let follower = fd.current_leader();
        let other = *metas.iter().find(|m| **m != follower).unwrap();

        let ack = BeaconAck {
            time_ms: 0,
            this_node: follower,
            primary_node: Some(other),
            is_master: false,
            allowed: true,
        };
        let (events, followup) =
            fd.on_beacon_ack(Some(ack), Instant::now());
        assert!(events.is_empty());
        assert_eq!(followup, BeaconFollowup::Immediate);
        assert_eq!(fd.current_leader(), other);
    }

    #[tokio::test(start_paused = true)]
    async fn master_registers_and_evicts_workers() {
        let meta = addr(3001);
        let worker = addr(4001);
        let mut master = MetaFailureDetector::new(meta, true, test_opts());

        let now = Instant::now();
        let beacon = Beacon {
            from_addr: worker,
            to_addr: meta,
            time_ms: 7,
        };
        let (ack, event) = master.on_beacon(&beacon, now);
        assert!(ack.is_master);
        assert_eq!(ack.time_ms, 7);
        assert_eq!(event, Some(FdEvent::WorkerConnected(worker)));

        // refresh does not re-announce
        let (_, event) = master.on_beacon(&beacon, now);
        assert_eq!(event, None);

        tokio::time::advance(Duration::from_secs(11)).await;
        let now = Instant::now();
        assert_eq!(
            master.check(now),
            vec![FdEvent::WorkerDisconnected(worker)]
        );
        assert!(master.workers().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn non_leader_redirects_workers() {
        let meta1 = addr(3001);
        let meta2 = addr(3002);
        let mut master = MetaFailureDetector::new(meta2, false, test_opts());
        master.set_leader(false, Some(meta1));

        let beacon = Beacon {
            from_addr: addr(4001),
            to_addr: meta2,
            time_ms: 0,
        };
        let (ack, event) = master.on_beacon(&beacon, Instant::now());
        assert!(!ack.is_master);
        assert_eq!(ack.primary_node, Some(meta1));
        assert_eq!(event, None);
    }
}
