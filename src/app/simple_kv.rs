//! In-memory string key-value app with rmp-encoded checkpoint files. The
//! reference app implementation and the one every scenario test runs on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::base::Decree;
use crate::messages::LearnState;
use crate::replica::Mutation;
use crate::utils::ReplicoreError;

use super::{CheckpointApplyMode, StateApp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Write and read commands accepted by the KV app, rmp-encoded into
/// mutation payloads and query requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Put { key: String, value: String },
}

/// Query results, rmp-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResult {
    Get { value: Option<String> },
}

/// Durable snapshot layout of one checkpoint file.
#[derive(Debug, Serialize, Deserialize)]
struct KvCheckpoint {
    last_committed_decree: Decree,
    state: HashMap<String, String>,
}

fn checkpoint_file_name(decree: Decree) -> String {
    format!("checkpoint.{}", decree)
}

fn parse_checkpoint_file_name(name: &str) -> Option<Decree> {
    name.strip_prefix("checkpoint.")?.parse::<Decree>().ok()
}

/// The app proper. Lives under `<replica_dir>/data`, stages incoming
/// learner files under `<replica_dir>/learn`.
pub struct SimpleKvApp {
    data_dir: PathBuf,
    learn_dir: PathBuf,
    state: HashMap<String, String>,
    last_committed_decree: Decree,
    last_durable_decree: Decree,
}

impl SimpleKvApp {
    pub fn new(replica_dir: &Path) -> Self {
        SimpleKvApp {
            data_dir: replica_dir.join("data"),
            learn_dir: replica_dir.join("learn"),
            state: HashMap::new(),
            last_committed_decree: 0,
            last_durable_decree: 0,
        }
    }

    /// Test/inspection helper: current value of a key.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.state.get(key)
    }

    pub fn encode_put(key: &str, value: &str) -> Vec<u8> {
        rmp_serde::to_vec(&KvCommand::Put {
            key: key.into(),
            value: value.into(),
        })
        .expect("kv command encoding cannot fail")
    }

    pub fn encode_get(key: &str) -> Vec<u8> {
        rmp_serde::to_vec(&KvCommand::Get { key: key.into() })
            .expect("kv command encoding cannot fail")
    }

    async fn latest_checkpoint(
        &self,
    ) -> Result<Option<(Decree, PathBuf)>, ReplicoreError> {
        if !self.data_dir.exists() {
            return Ok(None);
        }
        let mut best: Option<(Decree, PathBuf)> = None;
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(decree) = parse_checkpoint_file_name(name) {
                if best.as_ref().map(|(d, _)| decree > *d).unwrap_or(true) {
                    best = Some((decree, entry.path()));
                }
            }
        }
        Ok(best)
    }

    async fn load_checkpoint_file(
        &mut self,
        path: &Path,
    ) -> Result<(), ReplicoreError> {
        let bytes = fs::read(path).await?;
        let snapshot: KvCheckpoint = rmp_serde::from_slice(&bytes)?;
        self.state = snapshot.state;
        self.last_committed_decree = snapshot.last_committed_decree;
        self.last_durable_decree = snapshot.last_committed_decree;
        Ok(())
    }
}

#[async_trait]
impl StateApp for SimpleKvApp {
    async fn open(&mut self, create_new: bool) -> Result<(), ReplicoreError> {
        if create_new && self.data_dir.exists() {
            fs::remove_dir_all(&self.data_dir).await?;
        }
        fs::create_dir_all(&self.data_dir).await?;
        fs::create_dir_all(&self.learn_dir).await?;

        self.state.clear();
        self.last_committed_decree = 0;
        self.last_durable_decree = 0;
        if !create_new {
            if let Some((_, path)) = self.latest_checkpoint().await? {
                self.load_checkpoint_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self, clear_state: bool) -> Result<(), ReplicoreError> {
        if clear_state && self.data_dir.exists() {
            fs::remove_dir_all(&self.data_dir).await?;
        }
        self.state.clear();
        self.last_committed_decree = 0;
        self.last_durable_decree = 0;
        Ok(())
    }

    fn write_internal(&mut self, mu: &Mutation) -> Result<(), ReplicoreError> {
        if mu.header.decree != self.last_committed_decree + 1 {
            return Err(ReplicoreError(format!(
                "out-of-order write: decree {} after {}",
                mu.header.decree, self.last_committed_decree
            )));
        }

        for update in &mu.updates {
            let cmd: KvCommand = rmp_serde::from_slice(update)?;
            match cmd {
                KvCommand::Put { key, value } => {
                    self.state.insert(key, value);
                }
                KvCommand::Get { .. } => {
                    return Err(ReplicoreError::msg(
                        "read command in write path",
                    ));
                }
            }
        }
        self.last_committed_decree = mu.header.decree;
        Ok(())
    }

    fn query(&self, request: &[u8]) -> Result<Vec<u8>, ReplicoreError> {
        let cmd: KvCommand = rmp_serde::from_slice(request)?;
        match cmd {
            KvCommand::Get { key } => {
                let result = KvResult::Get {
                    value: self.state.get(&key).cloned(),
                };
                Ok(rmp_serde::to_vec(&result)?)
            }
            KvCommand::Put { .. } => {
                Err(ReplicoreError::msg("write command in query path"))
            }
        }
    }

    async fn flush(&mut self) -> Result<(), ReplicoreError> {
        self.checkpoint().await
    }

    async fn checkpoint(&mut self) -> Result<(), ReplicoreError> {
        if self.last_durable_decree == self.last_committed_decree {
            return Ok(());
        }

        let snapshot = KvCheckpoint {
            last_committed_decree: self.last_committed_decree,
            state: self.state.clone(),
        };
        let bytes = rmp_serde::to_vec(&snapshot)?;
        let path = self
            .data_dir
            .join(checkpoint_file_name(self.last_committed_decree));
        fs::write(&path, &bytes).await?;
        self.last_durable_decree = self.last_committed_decree;

        // older snapshots are superseded
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(decree) = parse_checkpoint_file_name(name) {
                if decree < self.last_durable_decree {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }
        Ok(())
    }

    async fn get_checkpoint(
        &mut self,
        _learn_start: Decree,
        _app_specific_request: &[u8],
    ) -> Result<LearnState, ReplicoreError> {
        if self.last_durable_decree < self.last_committed_decree {
            self.checkpoint().await?;
        }
        let Some((decree, path)) = self.latest_checkpoint().await? else {
            return Err(ReplicoreError::msg("no checkpoint available"));
        };
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| ReplicoreError::msg("bad checkpoint path"))?;

        Ok(LearnState {
            from_decree_excluded: 0,
            to_decree_included: decree,
            meta: Vec::new(),
            files: vec![name],
        })
    }

    async fn apply_checkpoint(
        &mut self,
        state: &LearnState,
        mode: CheckpointApplyMode,
    ) -> Result<(), ReplicoreError> {
        let base = match mode {
            CheckpointApplyMode::Learn => self.learn_dir.clone(),
            CheckpointApplyMode::Recover => self.data_dir.clone(),
        };
        let Some(file) = state.files.first() else {
            return Err(ReplicoreError::msg("checkpoint bundle has no files"));
        };
        self.load_checkpoint_file(&base.join(file)).await?;

        if mode == CheckpointApplyMode::Learn {
            // persist the adopted state under data/ as our own checkpoint
            self.last_durable_decree = 0;
            self.checkpoint().await?;
        }
        Ok(())
    }

    fn last_committed_decree(&self) -> Decree {
        self.last_committed_decree
    }

    fn last_durable_decree(&self) -> Decree {
        self.last_durable_decree
    }

    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn learn_dir(&self) -> PathBuf {
        self.learn_dir.clone()
    }
}
