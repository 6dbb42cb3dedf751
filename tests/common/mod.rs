//! A fake daemon speaking the control protocol on a real Unix socket.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use lilypad::modules::client::{read_message, write_message, Request, Response};
use lilypad::{DaemonError, DaemonState, Mounter};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Default)]
struct Shared {
    state: DaemonState,
    requests: Vec<Request>,
    failing: HashSet<String>,
    supervisor: Option<PathBuf>,
}

/// Serves requests until dropped.
pub struct FakeDaemon {
    shared: Arc<Mutex<Shared>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDaemon {
    pub fn start(socket: &Path) -> Result<Self> {
        let listener = UnixListener::bind(socket)?;
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Mutex::new(Shared::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let shared = shared.clone();
            let stop = stop.clone();
            thread::spawn(move || serve(listener, shared, stop))
        };
        Ok(Self {
            shared,
            stop,
            handle: Some(handle),
        })
    }

    pub fn set_state(&self, state: DaemonState) {
        self.shared.lock().state = state;
    }

    pub fn fail(&self, op: &str) {
        self.shared.lock().failing.insert(op.to_string());
    }

    /// Makes `send_fd` push a state blob to the supervisor at `path`.
    pub fn use_supervisor(&self, path: &Path) {
        self.shared.lock().supervisor = Some(path.to_path_buf());
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.lock().requests.clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.shared.lock().requests.iter().map(|r| r.name()).collect()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn serve(listener: UnixListener, shared: Arc<Mutex<Shared>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                // Readiness checks connect and hang up without a request.
                let _ = handle(stream, &shared);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    }
}

fn handle(mut stream: UnixStream, shared: &Mutex<Shared>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let req: Request = read_message(&mut stream)?;

    let (failing, state, supervisor) = {
        let mut s = shared.lock();
        s.requests.push(req.clone());
        (s.failing.contains(req.name()), s.state, s.supervisor.clone())
    };

    let resp = if failing {
        Response::Error {
            code: "EIO".to_string(),
            message: format!("{} failed", req.name()),
        }
    } else {
        match &req {
            Request::DaemonInfo => Response::Ok {
                body: json!({
                    "id": "fake",
                    "version": {"package_ver": "1.0.0"},
                    "state": state,
                }),
            },
            Request::SendFd => {
                if let Some(path) = supervisor {
                    let mut su = UnixStream::connect(path)?;
                    su.write_all(b"daemon-states")?;
                }
                Response::Ok { body: Value::Null }
            }
            Request::FsMetrics { .. } => Response::Ok {
                body: json!({"data_read": 4096, "nr_opens": 3}),
            },
            Request::InflightMetrics => Response::Ok {
                body: json!({"values": [{"thread_name": "w0", "fop": "read", "inode": 7}]}),
            },
            Request::CacheMetrics { id } => Response::Ok {
                body: json!({"id": id.clone().unwrap_or_default(), "total": 10, "whole_hits": 6}),
            },
            _ => Response::Ok { body: Value::Null },
        }
    };
    write_message(&mut stream, &resp)
}

/// Mounter keeping mounted targets in memory.
#[derive(Clone, Default)]
pub struct MemoryMounter {
    mounted: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MemoryMounter {
    pub fn mounted(&self) -> Vec<PathBuf> {
        let mut v: Vec<_> = self.mounted.lock().iter().cloned().collect();
        v.sort();
        v
    }
}

impl Mounter for MemoryMounter {
    fn mount_erofs(&self, _bootstrap: &Path, _domain_id: &str, _fscache_id: &str, target: &Path) -> Result<()> {
        if !self.mounted.lock().insert(target.to_path_buf()) {
            return Err(DaemonError::AlreadyMounted(target.to_path_buf()).into());
        }
        Ok(())
    }

    fn umount(&self, target: &Path) -> Result<()> {
        if self.mounted.lock().remove(target) {
            Ok(())
        } else {
            Err(anyhow!("{} is not mounted", target.display()))
        }
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounted.lock().contains(target))
    }
}

/// Lays out a snapshot directory with a bootstrap file.
pub fn snapshot_dir(root: &Path, id: &str) -> Result<PathBuf> {
    let dir = root.join("snapshots").join(id);
    std::fs::create_dir_all(dir.join("fs"))?;
    std::fs::write(dir.join("fs").join("image.boot"), b"bootstrap")?;
    Ok(dir)
}
