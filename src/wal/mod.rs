//! Append-only write-ahead log of mutations. One process-wide instance
//! multiplexes every partition (the shared log); a replica may additionally
//! own a single-tenant instance (its private log) for learner replay.
//!
//! Appends land in a pending buffer and are written as one block per batch
//! by a single writer task, so append acknowledgements resolve strictly in
//! append order.

mod log_file;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::base::{Decree, Gpid};
use crate::replica::Mutation;
use crate::utils::ReplicoreError;

use bytes::BytesMut;

use std::sync::OnceLock;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};

pub use log_file::{LogFileHeader, LogFileMeta};
use log_file::{
    encode_block, open_segment, parse_segment_file_name, read_next_block,
    segment_file_name,
};

/// Tuning knobs for one mutation log instance.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Rotate to a new segment when the current one would exceed this.
    pub max_file_size_bytes: u64,
    /// Flush the pending buffer once it holds at least this many bytes.
    pub batch_buffer_bytes: usize,
    /// Flush the pending buffer at least this often.
    pub pending_max_ms: u64,
    /// `sync_data` after every block write.
    pub force_flush: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            max_file_size_bytes: 32 * 1024 * 1024,
            batch_buffer_bytes: 256 * 1024,
            pending_max_ms: 25,
            force_flush: false,
        }
    }
}

impl LogOptions {
    /// Options for the process-wide shared log.
    pub fn shared(config: &crate::base::ReplicationConfig) -> Self {
        LogOptions {
            max_file_size_bytes: config.log_shared_file_size_mb * 1024 * 1024,
            batch_buffer_bytes: (config.log_shared_batch_buffer_kb * 1024)
                as usize,
            pending_max_ms: config.log_pending_max_ms,
            force_flush: config.log_shared_force_flush,
        }
    }

    /// Options for a replica's private log.
    pub fn private_log(config: &crate::base::ReplicationConfig) -> Self {
        LogOptions {
            max_file_size_bytes: config.log_private_file_size_mb * 1024 * 1024,
            batch_buffer_bytes: (config.log_private_batch_buffer_kb * 1024)
                as usize,
            pending_max_ms: config.log_pending_max_ms,
            force_flush: config.log_private_force_flush,
        }
    }
}

/// Resolves with the mutation's global end offset once its batch is durable.
pub type AppendAck = oneshot::Receiver<Result<u64, ReplicoreError>>;

type AckSender = oneshot::Sender<Result<u64, ReplicoreError>>;

/// One sealed batch of consecutive mutation frames awaiting the writer.
struct PendingBatch {
    first_offset: u64,
    buf: BytesMut,
    acks: Vec<(AckSender, u64)>,
    max_decrees: BTreeMap<Gpid, Decree>,
}

impl PendingBatch {
    fn new(first_offset: u64) -> Self {
        PendingBatch {
            first_offset,
            buf: BytesMut::new(),
            acks: Vec::new(),
            max_decrees: BTreeMap::new(),
        }
    }
}

/// State shared between appenders, the writer task, and metadata queries.
struct LogShared {
    started: bool,
    files: BTreeMap<u64, LogFileMeta>,
    global_start_offset: u64,
    global_end_offset: u64,
    /// Per-gpid max decree ever appended (or recovered by replay).
    max_decrees: BTreeMap<Gpid, Decree>,
    pending: Option<PendingBatch>,
}

enum WriterCmd {
    Flush(PendingBatch),
    Gc {
        durable_decrees: BTreeMap<Gpid, Decree>,
        max_seen_decrees: BTreeMap<Gpid, Decree>,
        reply: oneshot::Sender<Result<usize, ReplicoreError>>,
    },
    LearnState {
        gpid: Gpid,
        reply: oneshot::Sender<Result<(Vec<PathBuf>, Decree), ReplicoreError>>,
    },
    PartitionRemoved(Gpid),
    Reset {
        reply: oneshot::Sender<Result<(), ReplicoreError>>,
    },
    Sync {
        reply: oneshot::Sender<Result<(), ReplicoreError>>,
    },
}

/// Handle to one mutation log instance. Cheap to share via `Arc`.
pub struct MutationLog {
    dir: PathBuf,
    opts: LogOptions,
    shared: Arc<Mutex<LogShared>>,
    tx_writer: OnceLock<mpsc::UnboundedSender<WriterCmd>>,
}

impl MutationLog {
    /// Scans `dir` for existing segments and builds the file index. Fails on
    /// a segment whose header block does not validate. Appends are rejected
    /// until `start_write_service` is called (after replay).
    pub async fn open(
        dir: &Path,
        opts: LogOptions,
    ) -> Result<MutationLog, ReplicoreError> {
        fs::create_dir_all(dir).await?;

        let mut indices = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(index) = parse_segment_file_name(name) {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();

        let mut files = BTreeMap::new();
        for &index in &indices {
            let path = dir.join(segment_file_name(index));
            let (_file, meta) = open_segment(&path, index).await?;
            files.insert(index, meta);
        }

        // recover each sealed segment's reach from its successor's header
        let headers: Vec<(u64, BTreeMap<Gpid, Decree>)> = files
            .values()
            .map(|m| (m.index, m.header.init_max_decrees.clone()))
            .collect();
        for window in headers.windows(2) {
            let (prev_index, _) = window[0];
            let (_, next_init) = &window[1];
            if let Some(meta) = files.get_mut(&prev_index) {
                meta.seal_max_decrees = Some(next_init.clone());
            }
        }

        let global_start_offset = files
            .values()
            .next()
            .map(|m| m.header.start_global_offset)
            .unwrap_or(0);
        let max_decrees = files
            .values()
            .next_back()
            .map(|m| m.header.init_max_decrees.clone())
            .unwrap_or_default();

        let shared = LogShared {
            started: false,
            global_end_offset: global_start_offset,
            global_start_offset,
            files,
            max_decrees,
            pending: None,
        };

        Ok(MutationLog {
            dir: dir.to_path_buf(),
            opts,
            shared: Arc::new(Mutex::new(shared)),
            tx_writer: OnceLock::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn start_offset(&self) -> u64 {
        self.locked().global_start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.locked().global_end_offset
    }

    /// Max decree this log has seen for `gpid`, if any.
    pub fn max_decree(&self, gpid: Gpid) -> Option<Decree> {
        self.locked().max_decrees.get(&gpid).copied()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, LogShared> {
        self.shared.lock().expect("wal shared mutex poisoned")
    }

    /// Replays every decodable mutation in segment order, stopping cleanly
    /// at the first corrupt or short block (a torn tail). Returns the global
    /// offset one past the last valid frame. Must run before the write
    /// service starts.
    pub async fn replay<F>(
        &self,
        mut callback: F,
    ) -> Result<u64, ReplicoreError>
    where
        F: FnMut(Mutation),
    {
        let metas: Vec<LogFileMeta> =
            self.locked().files.values().cloned().collect();
        if self.locked().started {
            return logged_err!("wal"; "replay called after write service start");
        }

        let mut offset = self
            .locked()
            .files
            .values()
            .next()
            .map(|m| m.header.start_global_offset)
            .unwrap_or(0);

        'files: for meta in &metas {
            if meta.header.start_global_offset != offset {
                pf_warn!("wal";
                    "segment {} starts at offset {} but replay reached {}",
                    meta.index, meta.header.start_global_offset, offset);
            }
            offset = meta.header.start_global_offset;

            let mut file = File::open(&meta.path).await?;
            // skip the header block
            if read_next_block(&mut file).await?.is_none() {
                return logged_err!("wal";
                    "segment {} lost its header block", meta.index);
            }

            loop {
                let body = match read_next_block(&mut file).await? {
                    Some(body) => body,
                    None => break,
                };
                let mutations = match Mutation::parse_all(&body) {
                    Ok(mutations) => mutations,
                    // CRC-valid but undecodable: treat as corruption tail
                    Err(_) => break 'files,
                };
                for mu in mutations {
                    offset += frame_len(&mu)?;
                    let mut shared = self.locked();
                    let entry = shared
                        .max_decrees
                        .entry(mu.header.gpid)
                        .or_insert(0);
                    *entry = (*entry).max(mu.header.decree);
                    if let Some(m) = shared.files.get_mut(&meta.index) {
                        m.end_offset = offset;
                    }
                    drop(shared);
                    callback(mu);
                }
            }
        }

        self.locked().global_end_offset = offset;
        Ok(offset)
    }

    /// Replays a set of copied-over segment files (the learner's private-log
    /// apply path). Same tail-tolerance as instance replay.
    pub async fn replay_files<F>(
        files: &[PathBuf],
        mut callback: F,
    ) -> Result<(), ReplicoreError>
    where
        F: FnMut(Mutation),
    {
        let mut indexed: Vec<(u64, PathBuf)> = Vec::new();
        for path in files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            match parse_segment_file_name(name) {
                Some(index) => indexed.push((index, path.clone())),
                None => {
                    return Err(ReplicoreError(format!(
                        "not a log segment file: {}",
                        path.display()
                    )))
                }
            }
        }
        indexed.sort_unstable_by_key(|(index, _)| *index);

        'files: for (index, path) in &indexed {
            let (mut file, _meta) = open_segment(path, *index).await?;
            loop {
                let body = match read_next_block(&mut file).await? {
                    Some(body) => body,
                    None => break,
                };
                let mutations = match Mutation::parse_all(&body) {
                    Ok(mutations) => mutations,
                    Err(_) => break 'files,
                };
                for mu in mutations {
                    callback(mu);
                }
            }
        }
        Ok(())
    }

    /// Seals the recovered state as the starting point of new segments and
    /// spawns the writer task. `init_max_decrees` seeds the per-gpid reach
    /// recorded into the next segment header.
    pub fn start_write_service(
        &self,
        init_max_decrees: BTreeMap<Gpid, Decree>,
        max_staleness_for_commit: u32,
    ) -> Result<(), ReplicoreError> {
        if self.tx_writer.get().is_some() {
            return logged_err!("wal"; "write service already started");
        }

        let (cum_max, next_index) = {
            let mut shared = self.locked();
            for (gpid, decree) in init_max_decrees {
                let entry = shared.max_decrees.entry(gpid).or_insert(0);
                *entry = (*entry).max(decree);
            }
            shared.started = true;
            let next_index = shared
                .files
                .keys()
                .next_back()
                .map(|i| i + 1)
                .unwrap_or(1);
            (shared.max_decrees.clone(), next_index)
        };

        let (tx_writer, rx_writer) = mpsc::unbounded_channel();
        let writer = WalWriter {
            dir: self.dir.clone(),
            opts: self.opts.clone(),
            max_staleness_for_commit,
            shared: self.shared.clone(),
            cum_max,
            current: None,
            next_index,
            failed: false,
        };
        tokio::spawn(writer.writer_task(rx_writer));

        if self.tx_writer.set(tx_writer).is_err() {
            return logged_err!("wal"; "write service already started");
        }
        Ok(())
    }

    fn writer(
        &self,
    ) -> Result<&mpsc::UnboundedSender<WriterCmd>, ReplicoreError> {
        self.tx_writer
            .get()
            .ok_or_else(|| ReplicoreError::msg("wal write service not started"))
    }

    /// Enqueues a mutation for durable append. The returned ack resolves, in
    /// append order, once the containing batch has hit disk.
    pub fn append(&self, mu: &Mutation) -> Result<AppendAck, ReplicoreError> {
        let tx_writer = self.writer()?.clone();
        let (tx_ack, rx_ack) = oneshot::channel();

        let full_batch = {
            let mut shared = self.locked();
            if !shared.started {
                return Err(ReplicoreError::msg(
                    "wal write service not started",
                ));
            }

            let start = shared.global_end_offset;
            let mut patched = mu.clone();
            patched.header.log_offset = start;
            let mut frame = Vec::new();
            patched.serialize_into(&mut frame)?;
            let end = start + frame.len() as u64;

            let pending = shared
                .pending
                .get_or_insert_with(|| PendingBatch::new(start));
            pending.buf.extend_from_slice(&frame);
            pending.acks.push((tx_ack, end));
            let entry = pending.max_decrees.entry(mu.header.gpid).or_insert(0);
            *entry = (*entry).max(mu.header.decree);

            shared.global_end_offset = end;
            let entry = shared.max_decrees.entry(mu.header.gpid).or_insert(0);
            *entry = (*entry).max(mu.header.decree);

            if shared
                .pending
                .as_ref()
                .map(|p| p.buf.len() >= self.opts.batch_buffer_bytes)
                .unwrap_or(false)
            {
                shared.pending.take()
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            tx_writer
                .send(WriterCmd::Flush(batch))
                .map_err(|e| ReplicoreError(e.to_string()))?;
        }
        Ok(rx_ack)
    }

    /// Forces out the pending buffer and waits until all prior appends are
    /// on disk.
    pub async fn flush(&self) -> Result<(), ReplicoreError> {
        let (reply, rx) = oneshot::channel();
        self.writer()?.send(WriterCmd::Sync { reply })?;
        rx.await?
    }

    /// Deletes sealed prefix segments fully covered by durable state.
    /// Returns how many segments were removed. The write-open segment is
    /// never touched.
    pub async fn garbage_collection(
        &self,
        durable_decrees: BTreeMap<Gpid, Decree>,
        max_seen_decrees: BTreeMap<Gpid, Decree>,
    ) -> Result<usize, ReplicoreError> {
        let (reply, rx) = oneshot::channel();
        self.writer()?.send(WriterCmd::Gc {
            durable_decrees,
            max_seen_decrees,
            reply,
        })?;
        rx.await?
    }

    /// Flushes, then returns every segment file path plus the max decree on
    /// log for `gpid` — the transferable learner state in log mode.
    pub async fn get_learn_state(
        &self,
        gpid: Gpid,
    ) -> Result<(Vec<PathBuf>, Decree), ReplicoreError> {
        let (reply, rx) = oneshot::channel();
        self.writer()?.send(WriterCmd::LearnState { gpid, reply })?;
        rx.await?
    }

    /// Forgets a permanently-closed partition so its decrees no longer pin
    /// segments.
    pub fn on_partition_removed(&self, gpid: Gpid) -> Result<(), ReplicoreError> {
        self.writer()?.send(WriterCmd::PartitionRemoved(gpid))?;
        Ok(())
    }

    /// Drops every segment and restarts the log from offset zero. Used when
    /// a learner discards local state wholesale.
    pub async fn reset(&self) -> Result<(), ReplicoreError> {
        let (reply, rx) = oneshot::channel();
        self.writer()?.send(WriterCmd::Reset { reply })?;
        rx.await?
    }
}

fn frame_len(mu: &Mutation) -> Result<u64, ReplicoreError> {
    let body = rmp_serde::to_vec(mu)?;
    Ok(4 + body.len() as u64)
}

/// The single writer task behind one mutation log.
struct WalWriter {
    dir: PathBuf,
    opts: LogOptions,
    max_staleness_for_commit: u32,
    shared: Arc<Mutex<LogShared>>,
    /// Per-gpid max decree across everything written so far; snapshotted
    /// into each new segment header and each seal record.
    cum_max: BTreeMap<Gpid, Decree>,
    current: Option<CurrentFile>,
    next_index: u64,
    failed: bool,
}

struct CurrentFile {
    file: File,
    index: u64,
    /// Physical bytes written including the header block.
    file_bytes: u64,
}

impl WalWriter {
    async fn writer_task(mut self, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
        pf_debug!("wal"; "writer task spawned for {}", self.dir.display());
        let mut sweep =
            time::interval(Duration::from_millis(self.opts.pending_max_ms.max(1)));
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_cmd(cmd).await;
                },

                _ = sweep.tick() => {
                    let aged = self.take_pending();
                    if let Some(batch) = aged {
                        self.write_batch(batch).await;
                    }
                },
            }
        }
        pf_debug!("wal"; "writer task exiting for {}", self.dir.display());
    }

    fn take_pending(&self) -> Option<PendingBatch> {
        self.shared
            .lock()
            .expect("wal shared mutex poisoned")
            .pending
            .take()
    }

    async fn handle_cmd(&mut self, cmd: WriterCmd) {
        match cmd {
            WriterCmd::Flush(batch) => {
                self.write_batch(batch).await;
            }
            WriterCmd::Sync { reply } => {
                if let Some(batch) = self.take_pending() {
                    self.write_batch(batch).await;
                }
                let result = if self.failed {
                    Err(ReplicoreError::msg("wal writer in failed state"))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            WriterCmd::Gc {
                durable_decrees,
                max_seen_decrees,
                reply,
            } => {
                let result =
                    self.collect_garbage(&durable_decrees, &max_seen_decrees).await;
                let _ = reply.send(result);
            }
            WriterCmd::LearnState { gpid, reply } => {
                if let Some(batch) = self.take_pending() {
                    self.write_batch(batch).await;
                }
                let result = self.learn_state(gpid);
                let _ = reply.send(result);
            }
            WriterCmd::PartitionRemoved(gpid) => {
                self.cum_max.remove(&gpid);
                self.shared
                    .lock()
                    .expect("wal shared mutex poisoned")
                    .max_decrees
                    .remove(&gpid);
            }
            WriterCmd::Reset { reply } => {
                let result = self.reset_all().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn write_batch(&mut self, batch: PendingBatch) {
        if self.failed {
            fail_acks(batch.acks, "wal writer in failed state");
            return;
        }

        if let Err(e) = self.write_batch_inner(&batch).await {
            pf_error!("wal"; "batch write failed: {}", e);
            self.failed = true;
            fail_acks(batch.acks, &e.0);
            return;
        }

        for (gpid, decree) in batch.max_decrees {
            let entry = self.cum_max.entry(gpid).or_insert(0);
            *entry = (*entry).max(decree);
        }
        {
            let mut shared =
                self.shared.lock().expect("wal shared mutex poisoned");
            if let Some(cur) = &self.current {
                if let Some(meta) = shared.files.get_mut(&cur.index) {
                    meta.end_offset =
                        batch.first_offset + batch.buf.len() as u64;
                }
            }
        }
        for (tx, end_offset) in batch.acks {
            let _ = tx.send(Ok(end_offset));
        }
    }

    async fn write_batch_inner(
        &mut self,
        batch: &PendingBatch,
    ) -> Result<(), ReplicoreError> {
        let block = encode_block(&batch.buf);

        let rotate = match &self.current {
            None => true,
            Some(cur) => {
                cur.file_bytes + block.len() as u64
                    > self.opts.max_file_size_bytes
            }
        };
        if rotate {
            self.seal_current().await?;
            self.create_segment(batch.first_offset).await?;
        }

        let cur = self
            .current
            .as_mut()
            .ok_or_else(|| ReplicoreError::msg("no write-open segment"))?;
        cur.file.write_all(&block).await?;
        if self.opts.force_flush {
            cur.file.sync_data().await?;
        }
        cur.file_bytes += block.len() as u64;
        Ok(())
    }

    async fn seal_current(&mut self) -> Result<(), ReplicoreError> {
        if let Some(cur) = self.current.take() {
            cur.file.sync_all().await?;
            let mut shared =
                self.shared.lock().expect("wal shared mutex poisoned");
            if let Some(meta) = shared.files.get_mut(&cur.index) {
                meta.seal_max_decrees = Some(self.cum_max.clone());
            }
        }
        Ok(())
    }

    async fn create_segment(
        &mut self,
        start_offset: u64,
    ) -> Result<(), ReplicoreError> {
        let index = self.next_index;
        self.next_index += 1;
        let path = self.dir.join(segment_file_name(index));

        let header = LogFileHeader {
            version: log_file::LOG_FILE_VERSION,
            max_staleness_for_commit: self.max_staleness_for_commit,
            buffer_size_bytes: self.opts.batch_buffer_bytes as u32,
            start_global_offset: start_offset,
            init_max_decrees: self.cum_max.clone(),
        };
        let header_block = encode_block(&header.encode());

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        file.write_all(&header_block).await?;
        file.sync_all().await?;

        let meta = LogFileMeta {
            index,
            path: path.clone(),
            header,
            end_offset: start_offset,
            seal_max_decrees: None,
        };
        self.shared
            .lock()
            .expect("wal shared mutex poisoned")
            .files
            .insert(index, meta);

        self.current = Some(CurrentFile {
            file,
            index,
            file_bytes: header_block.len() as u64,
        });
        pf_debug!("wal"; "created segment {} at offset {}",
                  path.display(), start_offset);
        Ok(())
    }

    async fn collect_garbage(
        &mut self,
        durable_decrees: &BTreeMap<Gpid, Decree>,
        max_seen_decrees: &BTreeMap<Gpid, Decree>,
    ) -> Result<usize, ReplicoreError> {
        let mut deleted = 0usize;

        loop {
            let candidate = {
                let shared =
                    self.shared.lock().expect("wal shared mutex poisoned");
                if shared.files.len() <= 1 {
                    break;
                }
                let meta = shared.files.values().next().expect("non-empty");
                let Some(seal) = meta.seal_max_decrees.clone() else {
                    break;
                };
                (meta.index, meta.path.clone(), seal)
            };
            let (index, path, seal) = candidate;

            let mut deletable = true;
            for (gpid, max_decree) in &seal {
                match durable_decrees.get(gpid) {
                    Some(durable) if durable >= max_decree => {}
                    Some(_) => {
                        deletable = false;
                        break;
                    }
                    None => {
                        // unknown but still live partition pins the segment
                        if max_seen_decrees.contains_key(gpid) {
                            deletable = false;
                            break;
                        }
                    }
                }
            }
            if !deletable {
                break;
            }

            fs::remove_file(&path).await?;
            let mut shared =
                self.shared.lock().expect("wal shared mutex poisoned");
            shared.files.remove(&index);
            if let Some(next) = shared.files.values().next() {
                shared.global_start_offset =
                    next.header.start_global_offset;
            }
            drop(shared);
            deleted += 1;
            pf_info!("wal"; "gc deleted segment {}", path.display());
        }

        Ok(deleted)
    }

    fn learn_state(
        &self,
        gpid: Gpid,
    ) -> Result<(Vec<PathBuf>, Decree), ReplicoreError> {
        let shared = self.shared.lock().expect("wal shared mutex poisoned");
        let files = shared.files.values().map(|m| m.path.clone()).collect();
        let to_decree = shared.max_decrees.get(&gpid).copied().unwrap_or(0);
        Ok((files, to_decree))
    }

    async fn reset_all(&mut self) -> Result<(), ReplicoreError> {
        self.current = None;
        let paths: Vec<PathBuf> = {
            let shared =
                self.shared.lock().expect("wal shared mutex poisoned");
            shared.files.values().map(|m| m.path.clone()).collect()
        };
        for path in paths {
            fs::remove_file(&path).await?;
        }

        let mut shared = self.shared.lock().expect("wal shared mutex poisoned");
        shared.files.clear();
        shared.global_start_offset = 0;
        shared.global_end_offset = 0;
        shared.max_decrees.clear();
        if let Some(pending) = shared.pending.take() {
            drop(shared);
            fail_acks(pending.acks, "log reset discarded pending appends");
        }
        self.cum_max.clear();
        self.next_index = 1;
        self.failed = false;
        Ok(())
    }
}

fn fail_acks(acks: Vec<(AckSender, u64)>, msg: &str) {
    for (tx, _) in acks {
        let _ = tx.send(Err(ReplicoreError::msg(msg)));
    }
}

#[cfg(test)]
mod wal_tests {
    use super::log_file::LOG_BLOCK_MAGIC;
    use super::*;
    use crate::base::Gpid;
    use crate::replica::MutationHeader;

    fn test_mutation(gpid: Gpid, ballot: u64, decree: Decree) -> Mutation {
        Mutation::new(
            MutationHeader {
                gpid,
                ballot,
                decree,
                log_offset: 0,
                last_committed_decree: decree.saturating_sub(1),
                timestamp_ms: 0,
                client_request_id: decree,
            },
            1,
            format!("payload-{}", decree).into_bytes(),
        )
    }

    fn small_opts() -> LogOptions {
        LogOptions {
            max_file_size_bytes: 32 * 1024 * 1024,
            batch_buffer_bytes: 64 * 1024,
            pending_max_ms: 5,
            force_flush: true,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn append_acks_fifo_and_replay_roundtrip(
    ) -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let gpid = Gpid::new(1, 0);

        let mut log = MutationLog::open(dir.path(), small_opts()).await?;
        log.start_write_service(BTreeMap::new(), 10)?;

        let mut acks = Vec::new();
        for d in 1..=5 {
            acks.push(log.append(&test_mutation(gpid, 1, d))?);
        }
        log.flush().await?;

        let mut prev_end = 0;
        for ack in acks {
            let end = ack.await??;
            assert!(end > prev_end, "acks must resolve in append order");
            prev_end = end;
        }

        drop(log);
        let mut log = MutationLog::open(dir.path(), small_opts()).await?;
        let mut replayed = Vec::new();
        let end = log.replay(|mu| replayed.push(mu)).await?;
        assert_eq!(end, prev_end);
        assert_eq!(
            replayed.iter().map(|m| m.header.decree).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        // offsets were patched at append time and are strictly increasing
        for pair in replayed.windows(2) {
            assert!(pair[0].header.log_offset < pair[1].header.log_offset);
        }
        assert_eq!(log.max_decree(gpid), Some(5));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn size_threshold_triggers_flush() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let gpid = Gpid::new(1, 0);
        let opts = LogOptions {
            batch_buffer_bytes: 1, // every append fills the buffer
            pending_max_ms: 10_000, // timer will not help within the test
            ..small_opts()
        };

        let mut log = MutationLog::open(dir.path(), opts).await?;
        log.start_write_service(BTreeMap::new(), 10)?;

        let ack = log.append(&test_mutation(gpid, 1, 1))?;
        // resolves without an explicit flush call
        let end = ack.await??;
        assert!(end > 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn torn_tail_replays_valid_prefix() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let gpid = Gpid::new(1, 0);

        let mut log = MutationLog::open(dir.path(), small_opts()).await?;
        log.start_write_service(BTreeMap::new(), 10)?;
        for d in 1..=3 {
            let _ = log.append(&test_mutation(gpid, 1, d))?;
        }
        log.flush().await?;
        let good_end = log.end_offset();
        drop(log);

        // scribble a torn block at the end of the only segment
        let path = dir.path().join(segment_file_name(1));
        let mut bytes = std::fs::read(&path)?;
        bytes.extend_from_slice(&LOG_BLOCK_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 6]); // header cut short
        std::fs::write(&path, bytes)?;

        let mut log = MutationLog::open(dir.path(), small_opts()).await?;
        let mut decrees = Vec::new();
        let end = log.replay(|mu| decrees.push(mu.header.decree)).await?;
        assert_eq!(decrees, vec![1, 2, 3]);
        assert_eq!(end, good_end);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rotation_splits_segments() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let gpid = Gpid::new(2, 0);
        let opts = LogOptions {
            max_file_size_bytes: 256, // force frequent rotation
            batch_buffer_bytes: 1,
            ..small_opts()
        };

        let mut log = MutationLog::open(dir.path(), opts.clone()).await?;
        log.start_write_service(BTreeMap::new(), 10)?;
        for d in 1..=10 {
            let ack = log.append(&test_mutation(gpid, 1, d))?;
            ack.await??;
        }
        log.flush().await?;
        drop(log);

        let segments = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| {
                parse_segment_file_name(
                    e.file_name().to_str().unwrap_or_default(),
                )
                .is_some()
            })
            .count();
        assert!(segments > 1, "expected multiple segments, got {}", segments);

        let mut log = MutationLog::open(dir.path(), opts).await?;
        let mut decrees = Vec::new();
        log.replay(|mu| decrees.push(mu.header.decree)).await?;
        assert_eq!(decrees, (1..=10).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gc_waits_for_lagging_partition() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let g1 = Gpid::new(1, 0);
        let g2 = Gpid::new(1, 1);
        let opts = LogOptions {
            max_file_size_bytes: 1, // every batch rotates into a new segment
            batch_buffer_bytes: 1 << 30,
            pending_max_ms: 10_000,
            force_flush: true,
        };

        let mut log = MutationLog::open(dir.path(), opts).await?;
        log.start_write_service(BTreeMap::new(), 10)?;
        // one segment reaching {g1: 50, g2: 30}
        let _ = log.append(&test_mutation(g1, 1, 50))?;
        let _ = log.append(&test_mutation(g2, 1, 30))?;
        log.flush().await?;
        // follow-on segment so the earlier one is sealed
        let ack = log.append(&test_mutation(g1, 1, 60))?;
        log.flush().await?;
        ack.await??;

        // g2 lags behind the sealed reach of 30: nothing may go
        let durable = BTreeMap::from([(g1, 60), (g2, 25)]);
        let max_seen = BTreeMap::from([(g1, 60), (g2, 30)]);
        assert_eq!(
            log.garbage_collection(durable, max_seen.clone()).await?,
            0
        );

        // g2 catches up to 35: sealed prefix is collectible
        let durable = BTreeMap::from([(g1, 60), (g2, 35)]);
        let deleted = log.garbage_collection(durable, max_seen).await?;
        assert!(deleted > 0);

        // the write-open segment survives and still replays
        drop(log);
        let mut log = MutationLog::open(dir.path(), small_opts()).await?;
        let mut decrees = Vec::new();
        log.replay(|mu| decrees.push((mu.header.gpid, mu.header.decree)))
            .await?;
        assert!(decrees.contains(&(g1, 60)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn learn_state_covers_pending_appends() -> Result<(), ReplicoreError>
    {
        let dir = tempfile::tempdir()?;
        let gpid = Gpid::new(3, 0);
        let opts = LogOptions {
            pending_max_ms: 10_000,
            batch_buffer_bytes: 1 << 30, // keep everything pending
            ..small_opts()
        };

        let mut log = MutationLog::open(dir.path(), opts).await?;
        log.start_write_service(BTreeMap::new(), 10)?;
        for d in 1..=4 {
            let _ = log.append(&test_mutation(gpid, 1, d))?;
        }

        let (files, to_decree) = log.get_learn_state(gpid).await?;
        assert!(!files.is_empty());
        assert_eq!(to_decree, 4);

        let mut decrees = Vec::new();
        MutationLog::replay_files(&files, |mu| {
            decrees.push(mu.header.decree)
        })
        .await?;
        assert_eq!(decrees, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_discards_everything() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let gpid = Gpid::new(4, 0);

        let mut log = MutationLog::open(dir.path(), small_opts()).await?;
        log.start_write_service(BTreeMap::new(), 10)?;
        let ack = log.append(&test_mutation(gpid, 1, 7))?;
        ack.await??;

        log.reset().await?;
        assert_eq!(log.end_offset(), 0);
        assert_eq!(log.max_decree(gpid), None);

        // the log keeps working after a reset
        let ack = log.append(&test_mutation(gpid, 2, 1))?;
        ack.await??;
        assert_eq!(log.max_decree(gpid), Some(1));
        Ok(())
    }
}
