//! Typed failure kinds surfaced by daemon operations.
//!
//! Operations return `anyhow::Result` with context attached; the kinds below
//! stay reachable through `anyhow::Error::downcast_ref`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Classifiable errors raised while managing a daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The control socket never appeared; the daemon may have died before binding it.
    #[error("daemon socket {} not found, expected daemon pid {pid}", .socket.display())]
    SocketNotFound {
        /// Expected socket path
        socket: PathBuf,
        /// Process ID the socket was expected from
        pid: i32,
    },

    /// The control plane could not be reached.
    #[error("failed to connect to daemon at {}: {source}", .socket.display())]
    Connection {
        /// Socket that refused the connection
        socket: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// A control-plane call reached the daemon but failed.
    #[error("daemon request {op} failed ({code}): {message}")]
    Protocol {
        /// Request name
        op: String,
        /// Error code reported by the daemon
        code: String,
        /// Error message reported by the daemon
        message: String,
    },

    /// The kernel reported the erofs target as busy.
    #[error("erofs already mounted at {}", .0.display())]
    AlreadyMounted(PathBuf),

    /// No bootstrap file was found below the snapshot directory.
    #[error("bootstrap not found in {}", .0.display())]
    BootstrapNotFound(PathBuf),

    /// An fscache instance carries no bind annotations.
    #[error("instance {snapshot_id} has no annotation {key}")]
    MissingAnnotation {
        /// Snapshot ID of the instance
        snapshot_id: String,
        /// Missing annotation key
        key: &'static str,
    },

    /// The loaded configuration does not belong to the expected driver.
    #[error("configuration is not a {driver} daemon configuration")]
    UnexpectedConfig {
        /// Driver the configuration was expected for
        driver: String,
    },
}

/// Returns true if the error chain carries [`DaemonError::AlreadyMounted`].
pub fn is_already_mounted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DaemonError>(),
        Some(DaemonError::AlreadyMounted(_))
    )
}

/// Returns true if the error chain carries a not-found kind.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DaemonError>(),
        Some(DaemonError::SocketNotFound { .. }) | Some(DaemonError::BootstrapNotFound(_))
    )
}
