//! Replica server executable: hosts a `ReplicaStub` and all of its
//! replicas. The RPC envelope is owned by the embedding deployment; this
//! binary exposes the stub's channel endpoints (`inbound_sender` plus the
//! outbound pair created here) for the transport layer to bridge.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::mpsc;

use replicore::{pf_error, pf_info, ReplicaStub, ReplicationConfig, ReplicoreError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address this replica server is known by.
    #[arg(short, long)]
    addr: SocketAddr,

    /// Root directory for replica state and the shared log.
    #[arg(short, long, default_value = "/tmp/replicore")]
    dir: PathBuf,

    /// Meta server addresses (repeat for the whole group).
    #[arg(short, long, required = true)]
    meta_servers: Vec<SocketAddr>,

    /// Optional replication options as a TOML string.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    fn sanitize(&self) -> Result<ReplicationConfig, ReplicoreError> {
        if self.threads == 0 {
            return Err(ReplicoreError::msg("invalid number of threads 0"));
        }
        let mut seen = std::collections::HashSet::new();
        for meta in &self.meta_servers {
            if !seen.insert(meta) {
                return Err(ReplicoreError(format!(
                    "duplicate meta server address '{}' given",
                    meta
                )));
            }
        }

        let options = parse_options(self.config.as_deref())?;
        options.sanity_check()?;
        Ok(options)
    }
}

fn parse_options(
    config_str: Option<&str>,
) -> Result<ReplicationConfig, ReplicoreError> {
    use replicore::parsed_config;
    parsed_config!(config_str => ReplicationConfig;
                   prepare_timeout_ms_for_secondaries,
                   prepare_timeout_ms_for_potential_secondaries,
                   staleness_for_commit,
                   max_mutation_count_in_prepare_list,
                   mutation_2pc_min_replica_count,
                   group_check_interval_ms,
                   checkpoint_interval_seconds,
                   checkpoint_min_decree_gap,
                   gc_interval_ms,
                   gc_memory_replica_interval_ms,
                   gc_disk_error_replica_interval_seconds,
                   fd_check_interval_seconds,
                   fd_beacon_interval_seconds,
                   fd_lease_seconds,
                   fd_grace_seconds,
                   log_private_disabled,
                   log_private_file_size_mb,
                   log_private_batch_buffer_kb,
                   log_private_force_flush,
                   log_shared_file_size_mb,
                   log_shared_batch_buffer_kb,
                   log_shared_force_flush,
                   log_pending_max_ms,
                   config_sync_interval_ms,
                   lb_interval_ms)
}

async fn server_main(args: CliArgs) -> Result<(), ReplicoreError> {
    let options = args.sanitize()?;

    let (tx_out, mut rx_out) = mpsc::unbounded_channel();
    let mut stub = ReplicaStub::new_and_setup(
        args.addr,
        &args.dir,
        args.meta_servers.clone(),
        options,
        tx_out,
    )
    .await?;

    pf_info!("server";
        "replica server {} serving {} replicas from {}",
        args.addr, stub.replica_count(), args.dir.display());

    // transport bridge point: inbound messages go into `inbound_sender()`,
    // outbound messages drain from `rx_out`
    let _inbound = stub.inbound_sender();
    tokio::spawn(async move {
        while let Some((target, msg)) = rx_out.recv().await {
            log::trace!("(server) outbound to {}: {:?}", target, msg);
        }
    });

    stub.serve().await
}

fn main() -> Result<(), ReplicoreError> {
    let args = CliArgs::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("replicore-server")
        .build()?;

    runtime.block_on(async move {
        if let Err(e) = server_main(args).await {
            pf_error!("server"; "server exited with error: {}", e);
            return Err(e);
        }
        Ok(())
    })
}
