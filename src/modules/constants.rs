//! Names, limits and defaults shared across modules.

use std::time::Duration;

// Daemon layout
/// Control socket file name below the daemon socket dir.
pub const API_SOCKET_FILE_NAME: &str = "api.sock";
/// Daemon log file name.
pub const LOG_FILE_NAME: &str = "daemon.log";
/// Configuration file name of the daemon and of each instance.
pub const CONFIG_FILE_NAME: &str = "config.json";
/// Fixed ID of the shared daemon.
pub const SHARED_DAEMON_ID: &str = "shared_daemon";

// Bounded waits: 20 attempts x 100ms
/// Attempts of a bounded wait.
pub const RETRY_ATTEMPTS: u32 = 20;
/// Delay between two attempts of a bounded wait.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

// Control plane
/// Per-call I/O timeout on the control socket.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest accepted control message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

// Supervisor hand-off
/// How long the supervisor waits for its peer.
pub const SUPERVISOR_TIMEOUT: Duration = Duration::from_secs(10);
/// Most descriptors accepted in one state hand-off.
pub const MAX_STATE_FDS: usize = 16;
/// Largest state blob accepted in one hand-off.
pub const MAX_STATE_BYTES: usize = 16 * 1024 * 1024;

// Instance annotations recorded after an fscache bind
/// Cache domain the blob of an instance was bound in.
pub const ANNO_FSCACHE_DOMAIN_ID: &str = "lilypad.fscache.domain_id";
/// Cache object ID of an instance.
pub const ANNO_FSCACHE_ID: &str = "lilypad.fscache.id";

/// Mode of directories created for mounts.
pub const DEFAULT_PERMISSION: u32 = 0o755;
