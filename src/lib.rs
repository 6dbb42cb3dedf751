#![doc(html_root_url = "https://docs.rs/lilypad/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! lilypad: lifecycle and mount orchestration for image filesystem daemons
//!
//! A manager process spawns filesystem service daemons elsewhere and uses
//! this crate to keep track of them: which instances each daemon serves,
//! what state it is in, how to reach its control socket and how to mount,
//! unmount, fail over and finally tear it down.
//!
//! ## Features
//!
//! - Dedicated and shared daemons with reference-counted instances
//! - Two mount drivers: `fuse` through the daemon, `fscache` with erofs
//!   mounted by the manager
//! - Lazy, retried connection to the daemon control socket
//! - Failover through a supervisor holding the daemon state and descriptors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lilypad::{Daemon, DaemonMode, DaemonState, FsDriver, Instance};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let daemon = Daemon::builder()
//!     .daemon_mode(DaemonMode::Shared)
//!     .fs_driver(FsDriver::Fuse)
//!     .socket_dir("/run/lilypad/socket")
//!     .config_dir("/var/lib/lilypad/config")
//!     .mountpoint("/var/lib/lilypad/mnt")
//!     .build()?;
//!
//! // The process itself is spawned by the caller.
//! daemon.wait_until_state(DaemonState::Running)?;
//!
//! let instance = Arc::new(Instance::new(
//!     "snapshot-1",
//!     "docker.io/library/busybox:latest",
//!     "/var/lib/lilypad/snapshots/1",
//!     "/var/lib/lilypad/mnt/snapshot-1",
//! ));
//! daemon.add_instance(instance.clone());
//! daemon.shared_mount(&instance)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Drivers
//!
//! - `fuse`: instances appear below the daemon's host mountpoint
//! - `fscache`: blobs are bound into the kernel cache and erofs is mounted
//!   at each instance mountpoint

pub mod modules;

pub use modules::client::{ClientBuilder, DaemonClient, UnixClientBuilder, UnixSocketClient};
pub use modules::config::{DaemonConfig, DaemonMode, FsDriver};
pub use modules::daemon::{Daemon, DaemonBuilder, DaemonStates};
pub use modules::errors::DaemonError;
pub use modules::instance::{Instance, InstanceRegistry};
pub use modules::mount::{KernelMounter, Mounter};
pub use modules::retry::RetryPolicy;
pub use modules::supervisor::{StateSupervisor, Supervisor};

// Re-export commonly used types
pub use modules::types::{DaemonInfo, DaemonState};
