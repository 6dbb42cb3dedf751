use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lilypad::modules::constants::{ANNO_FSCACHE_DOMAIN_ID, ANNO_FSCACHE_ID};
use lilypad::modules::mount::fscache_id;
use lilypad::{
    Daemon, DaemonBuilder, DaemonConfig, DaemonState, DaemonStates, FsDriver, Instance,
    Supervisor,
};
use log::{info, LevelFilter};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON file holding the daemon descriptor
    #[arg(short, long, global = true, default_value = "daemon.json")]
    states: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print ID, version and state reported by the daemon
    Info,
    /// Query the daemon state
    State,
    /// Wait until the daemon reaches a state
    Wait {
        /// Expected state (init, ready, running)
        #[arg(long)]
        state: DaemonState,
        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Mount an instance through the daemon
    Mount {
        #[command(flatten)]
        instance: InstanceArgs,
        /// Configuration to install for the instance before mounting
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Unmount an instance
    Umount {
        #[command(flatten)]
        instance: InstanceArgs,
    },
    /// Make a freshly started daemon adopt its predecessor's state
    Takeover,
    /// Ask the daemon to begin serving
    Start,
    /// Ask the daemon to exit gracefully
    Exit,
    /// Terminate the daemon process and wait for it
    Stop,
    /// Remove mounts and the socket left behind by a dead daemon
    ClearVestige,
    /// Print daemon metrics
    Metrics {
        /// Which metrics
        #[arg(value_enum)]
        kind: MetricsKind,
        /// Restrict to one instance
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(clap::Args)]
struct InstanceArgs {
    /// Snapshot ID of the instance
    #[arg(long)]
    snapshot_id: String,
    /// Snapshot working directory
    #[arg(long)]
    snapshot_dir: PathBuf,
    /// Absolute mountpoint of the instance
    #[arg(long)]
    mountpoint: PathBuf,
    /// Image the snapshot belongs to
    #[arg(long, default_value = "")]
    image_id: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum MetricsKind {
    Fs,
    Inflight,
    Cache,
}

fn load_daemon(path: &Path) -> Result<Daemon> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("read daemon states {}", path.display()))?;
    let states: DaemonStates = serde_json::from_str(&content)
        .with_context(|| format!("parse daemon states {}", path.display()))?;

    let mut builder = DaemonBuilder::from_states(states.clone());
    if let Some(su) = &states.supervisor_path {
        builder = builder.supervisor(Arc::new(Supervisor::new(states.id.clone(), su)));
    }
    builder.build()
}

fn instance_of(daemon: &Daemon, args: &InstanceArgs) -> Arc<Instance> {
    let instance = Arc::new(Instance::new(
        args.snapshot_id.as_str(),
        args.image_id.as_str(),
        &args.snapshot_dir,
        &args.mountpoint,
    ));
    daemon.add_instance(instance.clone());
    instance
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let daemon = Arc::new(load_daemon(&cli.states)?);
    info!("loaded daemon {} from {}", daemon.id(), cli.states.display());

    match &cli.command {
        Commands::Info => print_json(&daemon.daemon_info()?)?,
        Commands::State => println!("{}", daemon.query_state()?),
        Commands::Wait { state, timeout_ms } => {
            let expected = *state;
            let d = daemon.clone();
            let wait = tokio::task::spawn_blocking(move || d.wait_until_state(expected));
            tokio::time::timeout(Duration::from_millis(*timeout_ms), wait)
                .await
                .with_context(|| format!("daemon {} did not become {} in time", daemon.id(), expected))???;
            println!("{}", daemon.state());
        }
        Commands::Mount { instance, config } => {
            if let Some(path) = config {
                DaemonConfig::load(daemon.fs_driver(), path)?
                    .dump_file(&daemon.config_file(&instance.snapshot_id))?;
            }
            let inst = instance_of(&daemon, instance);
            daemon.shared_mount(&inst)?;
            println!("Mounted {} at {}", inst.snapshot_id, inst.mountpoint().display());
        }
        Commands::Umount { instance } => {
            let inst = instance_of(&daemon, instance);
            if daemon.fs_driver() == FsDriver::Fscache {
                // Annotations do not outlive the process that mounted the
                // instance, rebuild them from its configuration.
                let cfg = DaemonConfig::load(
                    FsDriver::Fscache,
                    &daemon.config_file(&inst.snapshot_id),
                )?;
                inst.add_annotation(ANNO_FSCACHE_DOMAIN_ID, &cfg.as_fscache()?.domain_id);
                inst.add_annotation(ANNO_FSCACHE_ID, &fscache_id(&inst.snapshot_id));
            }
            daemon.shared_umount(&inst)?;
            daemon.remove_instance(&inst.snapshot_id);
            println!("Unmounted {}", inst.snapshot_id);
        }
        Commands::Takeover => daemon.take_over()?,
        Commands::Start => daemon.start()?,
        Commands::Exit => daemon.exit()?,
        Commands::Stop => {
            daemon.terminate()?;
            daemon.wait()?;
            println!("Daemon {} stopped", daemon.id());
        }
        Commands::ClearVestige => {
            daemon.clear_vestige();
            println!("Cleared vestige of daemon {}", daemon.id());
        }
        Commands::Metrics { kind, id } => match kind {
            MetricsKind::Fs => print_json(&daemon.fs_metrics(id.as_deref())?)?,
            MetricsKind::Inflight => print_json(&daemon.inflight_metrics()?)?,
            MetricsKind::Cache => print_json(&daemon.cache_metrics(id.as_deref())?)?,
        },
    }

    Ok(())
}
