//! Pluggable state machine ("app") interface and the registry of known app
//! types. A replica drives its app exclusively through [`StateApp`]; the
//! concrete type is chosen by the `app_type` string in the partition
//! configuration.

mod simple_kv;

use std::path::{Path, PathBuf};

use crate::base::Decree;
use crate::messages::LearnState;
use crate::replica::Mutation;
use crate::utils::ReplicoreError;

use async_trait::async_trait;

pub use simple_kv::{KvCommand, KvResult, SimpleKvApp};

/// How a checkpoint bundle is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointApplyMode {
    /// Incoming learner state replacing local state.
    Learn,
    /// Local recovery from our own checkpoint files.
    Recover,
}

/// Capability set every replicated app implements. Write-path calls are
/// synchronous (they run on the replica's own event loop); everything that
/// touches disk is async.
#[async_trait]
pub trait StateApp: Send {
    /// Opens the app, creating a fresh empty state when `create_new` (any
    /// existing durable state is discarded).
    async fn open(&mut self, create_new: bool) -> Result<(), ReplicoreError>;

    /// Closes the app; `clear_state` also removes its durable state.
    async fn close(&mut self, clear_state: bool) -> Result<(), ReplicoreError>;

    /// Applies one committed mutation. Decrees must arrive in order,
    /// `last_committed_decree() + 1` each time.
    fn write_internal(&mut self, mu: &Mutation) -> Result<(), ReplicoreError>;

    /// Serves a read-only request against current state.
    fn query(&self, request: &[u8]) -> Result<Vec<u8>, ReplicoreError>;

    /// Pushes in-memory writes toward durability (same effect as
    /// `checkpoint` for apps without a separate write buffer).
    async fn flush(&mut self) -> Result<(), ReplicoreError>;

    /// Makes all committed state durable, advancing `last_durable_decree`
    /// to `last_committed_decree`.
    async fn checkpoint(&mut self) -> Result<(), ReplicoreError>;

    /// Materializes transferable checkpoint state covering at least
    /// decree `learn_start - 1`.
    async fn get_checkpoint(
        &mut self,
        learn_start: Decree,
        app_specific_request: &[u8],
    ) -> Result<LearnState, ReplicoreError>;

    /// Installs a received checkpoint bundle, replacing local state.
    async fn apply_checkpoint(
        &mut self,
        state: &LearnState,
        mode: CheckpointApplyMode,
    ) -> Result<(), ReplicoreError>;

    /// App-specific blob attached to outgoing learn requests.
    fn prepare_learn_request(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Whether the app can emit incremental (delta) learn state instead of
    /// full checkpoints.
    fn is_delta_state_learning_supported(&self) -> bool {
        false
    }

    fn last_committed_decree(&self) -> Decree;
    fn last_durable_decree(&self) -> Decree;
    fn data_dir(&self) -> &Path;
    fn learn_dir(&self) -> PathBuf;
}

/// Registry of app types, keyed by the `app_type` string carried in
/// partition configurations. Frozen at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    SimpleKv,
}

impl AppKind {
    /// Parses an `app_type` string.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "simple_kv" => Some(Self::SimpleKv),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SimpleKv => "simple_kv",
        }
    }

    /// Instantiates an (unopened) app rooted at a replica directory.
    pub fn create(&self, replica_dir: &Path) -> Box<dyn StateApp> {
        match self {
            Self::SimpleKv => Box::new(SimpleKvApp::new(replica_dir)),
        }
    }
}
