//! Control-plane client for a daemon process.
//!
//! Requests and responses are JSON documents framed with a 4-byte
//! little-endian length prefix. Every call opens its own connection on the
//! daemon's API socket, so a handle can be shared freely between threads.

use anyhow::{bail, Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::constants::{CLIENT_TIMEOUT, MAX_MESSAGE_SIZE};
use super::errors::DaemonError;
use super::types::{CacheMetrics, DaemonInfo, FsMetrics, InflightMetrics};

/// Operations exposed by a daemon over its control plane.
pub trait DaemonClient: Send + Sync {
    /// Queries ID, version and state of the daemon.
    fn daemon_info(&self) -> Result<DaemonInfo>;
    /// Mounts an instance at `mountpoint` (relative to the daemon's host mountpoint).
    fn mount(&self, mountpoint: &str, bootstrap: &Path, config: &str) -> Result<()>;
    /// Unmounts the instance at `mountpoint`.
    fn umount(&self, mountpoint: &str) -> Result<()>;
    /// Binds a blob into the kernel cache.
    fn bind_blob(&self, config: &str) -> Result<()>;
    /// Releases a blob from the kernel cache.
    fn unbind_blob(&self, domain_id: &str, blob_id: &str) -> Result<()>;
    /// Asks the daemon to hand its state and descriptors to its supervisor.
    fn send_fd(&self) -> Result<()>;
    /// Asks the daemon to adopt the state of its predecessor.
    fn take_over(&self) -> Result<()>;
    /// Asks the daemon to begin serving.
    fn start(&self) -> Result<()>;
    /// Asks the daemon to exit gracefully.
    fn exit(&self) -> Result<()>;
    /// Filesystem counters, for one instance or for the whole daemon.
    fn fs_metrics(&self, id: Option<&str>) -> Result<FsMetrics>;
    /// Operations currently in flight.
    fn inflight_metrics(&self) -> Result<InflightMetrics>;
    /// Blob cache counters, for one instance or for the whole daemon.
    fn cache_metrics(&self, id: Option<&str>) -> Result<CacheMetrics>;
}

/// Builds control-plane handles bound to a socket path.
pub trait ClientBuilder: Send + Sync {
    /// Creates a handle for the daemon listening on `socket`.
    fn build(&self, socket: &Path) -> Result<Arc<dyn DaemonClient>>;
}

/// Builds [`UnixSocketClient`] handles.
#[derive(Debug, Clone, Default)]
pub struct UnixClientBuilder;

impl ClientBuilder for UnixClientBuilder {
    fn build(&self, socket: &Path) -> Result<Arc<dyn DaemonClient>> {
        Ok(Arc::new(UnixSocketClient::new(socket)))
    }
}

/// A control-plane request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Query daemon information
    DaemonInfo,
    /// Mount an instance
    Mount {
        /// Mountpoint relative to the host mountpoint
        mountpoint: String,
        /// Bootstrap file of the image
        source: PathBuf,
        /// Serialized instance configuration
        config: String,
    },
    /// Unmount an instance
    Umount {
        /// Mountpoint relative to the host mountpoint
        mountpoint: String,
    },
    /// Bind a blob into the kernel cache
    BindBlob {
        /// Serialized fscache configuration
        config: String,
    },
    /// Release a blob from the kernel cache
    UnbindBlob {
        /// Cache domain, empty to release the bootstrap cache file
        domain_id: String,
        /// Cache object ID
        blob_id: String,
    },
    /// Send state and descriptors to the supervisor
    SendFd,
    /// Take over from a predecessor
    TakeOver,
    /// Begin serving
    Start,
    /// Exit gracefully
    Exit,
    /// Filesystem counters
    FsMetrics {
        /// Instance ID, all instances when absent
        id: Option<String>,
    },
    /// In-flight operations
    InflightMetrics,
    /// Blob cache counters
    CacheMetrics {
        /// Instance ID, all instances when absent
        id: Option<String>,
    },
}

impl Request {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Request::DaemonInfo => "daemon_info",
            Request::Mount { .. } => "mount",
            Request::Umount { .. } => "umount",
            Request::BindBlob { .. } => "bind_blob",
            Request::UnbindBlob { .. } => "unbind_blob",
            Request::SendFd => "send_fd",
            Request::TakeOver => "take_over",
            Request::Start => "start",
            Request::Exit => "exit",
            Request::FsMetrics { .. } => "fs_metrics",
            Request::InflightMetrics => "inflight_metrics",
            Request::CacheMetrics { .. } => "cache_metrics",
        }
    }
}

/// A control-plane response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The request succeeded
    Ok {
        /// Reply payload, `null` for requests without one
        #[serde(default)]
        body: Value,
    },
    /// The request failed inside the daemon
    Error {
        /// Error code
        code: String,
        /// Human readable message
        message: String,
    },
}

/// Encodes a message with its length prefix.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        bail!("message too large: {} bytes", payload.len());
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes a message body (after the length prefix).
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Writes one framed message.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<()> {
    w.write_all(&encode_message(msg)?)?;
    w.flush()?;
    Ok(())
}

/// Reads one framed message.
pub fn read_message<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_MESSAGE_SIZE {
        bail!("message too large: {} bytes", len);
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    decode_message(&body)
}

/// Client speaking the control protocol over a Unix socket.
#[derive(Debug, Clone)]
pub struct UnixSocketClient {
    socket: PathBuf,
    timeout: Duration,
}

impl UnixSocketClient {
    /// Creates a client for the daemon listening on `socket`.
    pub fn new<P: AsRef<Path>>(socket: P) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            timeout: CLIENT_TIMEOUT,
        }
    }

    /// Overrides the per-call I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Socket this client talks to.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn call(&self, req: Request) -> Result<Value> {
        let op = req.name();
        debug!("daemon request {} on {}", op, self.socket.display());

        let mut stream = UnixStream::connect(&self.socket).map_err(|e| DaemonError::Connection {
            socket: self.socket.clone(),
            source: e,
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        write_message(&mut stream, &req).with_context(|| format!("send {} request", op))?;
        let resp: Response =
            read_message(&mut stream).with_context(|| format!("read {} response", op))?;

        match resp {
            Response::Ok { body } => Ok(body),
            Response::Error { code, message } => Err(DaemonError::Protocol {
                op: op.to_string(),
                code,
                message,
            }
            .into()),
        }
    }

    fn call_typed<T: DeserializeOwned>(&self, req: Request) -> Result<T> {
        let op = req.name();
        let body = self.call(req)?;
        serde_json::from_value(body).with_context(|| format!("decode {} reply", op))
    }
}

impl DaemonClient for UnixSocketClient {
    fn daemon_info(&self) -> Result<DaemonInfo> {
        self.call_typed(Request::DaemonInfo)
    }

    fn mount(&self, mountpoint: &str, bootstrap: &Path, config: &str) -> Result<()> {
        self.call(Request::Mount {
            mountpoint: mountpoint.to_string(),
            source: bootstrap.to_path_buf(),
            config: config.to_string(),
        })
        .map(|_| ())
    }

    fn umount(&self, mountpoint: &str) -> Result<()> {
        self.call(Request::Umount {
            mountpoint: mountpoint.to_string(),
        })
        .map(|_| ())
    }

    fn bind_blob(&self, config: &str) -> Result<()> {
        self.call(Request::BindBlob {
            config: config.to_string(),
        })
        .map(|_| ())
    }

    fn unbind_blob(&self, domain_id: &str, blob_id: &str) -> Result<()> {
        self.call(Request::UnbindBlob {
            domain_id: domain_id.to_string(),
            blob_id: blob_id.to_string(),
        })
        .map(|_| ())
    }

    fn send_fd(&self) -> Result<()> {
        self.call(Request::SendFd).map(|_| ())
    }

    fn take_over(&self) -> Result<()> {
        self.call(Request::TakeOver).map(|_| ())
    }

    fn start(&self) -> Result<()> {
        self.call(Request::Start).map(|_| ())
    }

    fn exit(&self) -> Result<()> {
        self.call(Request::Exit).map(|_| ())
    }

    fn fs_metrics(&self, id: Option<&str>) -> Result<FsMetrics> {
        self.call_typed(Request::FsMetrics {
            id: id.map(str::to_string),
        })
    }

    fn inflight_metrics(&self) -> Result<InflightMetrics> {
        self.call_typed(Request::InflightMetrics)
    }

    fn cache_metrics(&self, id: Option<&str>) -> Result<CacheMetrics> {
        self.call_typed(Request::CacheMetrics {
            id: id.map(str::to_string),
        })
    }
}
