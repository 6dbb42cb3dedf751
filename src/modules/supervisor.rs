//! Supervisor keeping a daemon's state across process generations.
//!
//! A running daemon sends its state and open descriptors to the supervisor
//! socket when asked. When a successor process is started for take-over it
//! connects to the same socket and receives what was saved.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use parking_lot::Mutex;
use std::fs;
use std::io::{ErrorKind, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use super::constants::{MAX_STATE_BYTES, MAX_STATE_FDS, SUPERVISOR_TIMEOUT};

const RECV_CHUNK: usize = 64 * 1024;

/// Collects daemon states on behalf of a daemon.
pub trait StateSupervisor: Send + Sync {
    /// Prepares to receive states, runs `trigger` to make the daemon send
    /// them, then waits for them to arrive.
    fn fetch_daemon_states(&self, trigger: &dyn Fn() -> Result<()>) -> Result<()>;
}

struct SavedStates {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
}

/// Supervisor listening on a Unix socket.
pub struct Supervisor {
    id: String,
    path: PathBuf,
    timeout: Duration,
    states: Mutex<Option<SavedStates>>,
    // One fetch at a time owns the socket path.
    fetching: Mutex<()>,
}

impl Supervisor {
    /// Creates a supervisor for daemon `id` using the socket at `path`.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(id: S, path: P) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            timeout: SUPERVISOR_TIMEOUT,
            states: Mutex::new(None),
            fetching: Mutex::new(()),
        }
    }

    /// Overrides how long to wait for the peer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Supervisor socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether states were received and not yet replaced.
    pub fn has_states(&self) -> bool {
        self.states.lock().is_some()
    }

    /// Number of descriptors held for the successor.
    pub fn fd_count(&self) -> usize {
        self.states.lock().as_ref().map_or(0, |s| s.fds.len())
    }

    /// Serves the saved states to a successor connecting to the socket.
    pub fn send_states(&self) -> Result<()> {
        // Duplicated so the saved copy stays unlocked while waiting for the peer.
        let (data, owned) = {
            let guard = self.states.lock();
            let Some(saved) = guard.as_ref() else {
                bail!("supervisor {} has no states to send", self.id);
            };
            let owned = saved
                .fds
                .iter()
                .map(|fd| fd.try_clone())
                .collect::<std::io::Result<Vec<_>>>()
                .context("duplicate saved fds")?;
            (saved.data.clone(), owned)
        };

        let listener = self.listen()?;
        let deadline = Instant::now() + self.timeout;
        let stream = accept_before(&listener, deadline, &AtomicBool::new(false))
            .with_context(|| format!("wait for successor of daemon {}", self.id))?;
        let fds: Vec<RawFd> = owned.iter().map(|fd| fd.as_raw_fd()).collect();
        send_with_fds(&stream, &data, &fds)
            .with_context(|| format!("send states of daemon {}", self.id))?;

        info!(
            "supervisor {} sent {} bytes and {} fds",
            self.id,
            data.len(),
            fds.len()
        );
        Ok(())
    }

    fn listen(&self) -> Result<UnixListener> {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed stale supervisor socket {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("remove supervisor socket {}", self.path.display()))
            }
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        UnixListener::bind(&self.path)
            .with_context(|| format!("listen on supervisor socket {}", self.path.display()))
    }
}

impl StateSupervisor for Supervisor {
    fn fetch_daemon_states(&self, trigger: &dyn Fn() -> Result<()>) -> Result<()> {
        let _fetching = self.fetching.lock();
        let listener = self.listen()?;
        let deadline = Instant::now() + self.timeout;

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = {
            let stop = stop.clone();
            thread::spawn(move || {
                let result =
                    accept_before(&listener, deadline, &stop).and_then(|s| recv_with_fds(&s));
                let _ = tx.send(result);
            })
        };

        if let Err(e) = trigger() {
            stop.store(true, Ordering::SeqCst);
            let _ = receiver.join();
            return Err(e);
        }

        let received = rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()) + Duration::from_millis(100))
            .with_context(|| format!("supervisor {} receive states", self.id))?;
        let _ = receiver.join();
        let saved = received.with_context(|| format!("supervisor {} receive states", self.id))?;

        info!(
            "supervisor {} saved {} bytes and {} fds",
            self.id,
            saved.data.len(),
            saved.fds.len()
        );
        *self.states.lock() = Some(saved);
        Ok(())
    }
}

fn accept_before(
    listener: &UnixListener,
    deadline: Instant,
    stop: &AtomicBool,
) -> Result<UnixStream> {
    listener.set_nonblocking(true)?;
    loop {
        if stop.load(Ordering::SeqCst) {
            bail!("stopped waiting for peer");
        }
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(
                    deadline
                        .saturating_duration_since(Instant::now())
                        .max(Duration::from_millis(100)),
                ))?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    bail!("timed out waiting for peer");
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// Reads until the peer closes its end.
fn recv_with_fds(stream: &UnixStream) -> Result<SavedStates> {
    let mut data = Vec::new();
    let mut fds = Vec::new();
    let mut chunk = vec![0u8; RECV_CHUNK];
    loop {
        let mut cmsg = nix::cmsg_space!([RawFd; MAX_STATE_FDS]);
        let (bytes, truncated) = {
            let mut iov = [IoSliceMut::new(&mut chunk)];
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            for c in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(raw) = c {
                    // Received descriptors are owned by this process from now on.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            let flags = MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC;
            (msg.bytes, msg.flags.intersects(flags))
        };
        if truncated {
            bail!("states truncated, at most {} fds are accepted", MAX_STATE_FDS);
        }
        if bytes == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..bytes]);
        if data.len() > MAX_STATE_BYTES {
            bail!("states larger than {} bytes", MAX_STATE_BYTES);
        }
    }
    if data.is_empty() && fds.is_empty() {
        bail!("peer closed without sending states");
    }
    Ok(SavedStates { data, fds })
}

fn send_with_fds(stream: &UnixStream, data: &[u8], fds: &[RawFd]) -> Result<()> {
    let iov = [IoSlice::new(data)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
    sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_retry(path: &Path) -> UnixStream {
        for _ in 0..200 {
            if let Ok(s) = UnixStream::connect(path) {
                return s;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("cannot connect to {}", path.display());
    }

    #[test]
    fn test_fetch_and_hand_off_states() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Supervisor::new("d1", &path).with_timeout(Duration::from_secs(5));

        let shared = tempfile::tempfile()?;
        let shared_fd = shared.as_raw_fd();
        let sock = path.clone();
        su.fetch_daemon_states(&|| {
            let stream = UnixStream::connect(&sock)?;
            send_with_fds(&stream, b"daemon-state", &[shared_fd])
        })?;
        assert!(su.has_states());
        assert_eq!(su.fd_count(), 1);

        let su = std::sync::Arc::new(su);
        let sender = {
            let su = su.clone();
            thread::spawn(move || su.send_states())
        };
        let stream = connect_retry(&path);
        let received = recv_with_fds(&stream)?;
        sender.join().unwrap()?;

        assert_eq!(received.data, b"daemon-state");
        assert_eq!(received.fds.len(), 1);
        Ok(())
    }

    #[test]
    fn test_trigger_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let su = Supervisor::new("d1", dir.path().join("supervisor.sock"))
            .with_timeout(Duration::from_millis(200));
        let err = su
            .fetch_daemon_states(&|| bail!("daemon does not support sending states"))
            .unwrap_err();
        assert!(err.to_string().contains("does not support"));
        assert!(!su.has_states());
    }

    #[test]
    fn test_trigger_failure_stops_receiver() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Supervisor::new("d1", &path).with_timeout(Duration::from_secs(10));

        let started = Instant::now();
        assert!(su.fetch_daemon_states(&|| bail!("no states")).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));

        // The socket is free for the next fetch right away.
        let sock = path.clone();
        su.fetch_daemon_states(&|| {
            let stream = UnixStream::connect(&sock)?;
            send_with_fds(&stream, b"second", &[])
        })?;
        assert!(su.has_states());
        Ok(())
    }

    #[test]
    fn test_concurrent_fetches_are_serialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Arc::new(Supervisor::new("d1", &path).with_timeout(Duration::from_secs(5)));

        let fetchers: Vec<_> = (0..2)
            .map(|i| {
                let su = su.clone();
                let sock = path.clone();
                thread::spawn(move || {
                    su.fetch_daemon_states(&|| {
                        thread::sleep(Duration::from_millis(50));
                        let stream = UnixStream::connect(&sock)?;
                        send_with_fds(&stream, format!("state-{}", i).as_bytes(), &[])
                    })
                })
            })
            .collect();

        let started = Instant::now();
        for f in fetchers {
            f.join().unwrap()?;
        }
        assert!(started.elapsed() < Duration::from_secs(3));
        let data = su.states.lock().as_ref().map(|s| s.data.clone()).unwrap();
        assert!(data == b"state-0" || data == b"state-1");
        Ok(())
    }

    #[test]
    fn test_large_states_read_completely() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Supervisor::new("d1", &path).with_timeout(Duration::from_secs(5));

        let payload = vec![7u8; 3 * RECV_CHUNK + 17];
        let sock = path.clone();
        let sent = payload.clone();
        su.fetch_daemon_states(&|| {
            let sock = sock.clone();
            let sent = sent.clone();
            // A peer writing more than one socket buffer needs a reader running.
            thread::spawn(move || -> Result<()> {
                let mut stream = UnixStream::connect(&sock)?;
                std::io::Write::write_all(&mut stream, &sent)?;
                Ok(())
            });
            Ok(())
        })?;

        let data = su.states.lock().as_ref().map(|s| s.data.clone()).unwrap();
        assert_eq!(data.len(), payload.len());
        assert_eq!(data, payload);
        Ok(())
    }

    #[test]
    fn test_too_many_fds_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Supervisor::new("d1", &path).with_timeout(Duration::from_secs(5));

        let file = tempfile::tempfile()?;
        let fds = vec![file.as_raw_fd(); MAX_STATE_FDS + 4];
        let sock = path.clone();
        let err = su
            .fetch_daemon_states(&|| {
                let stream = UnixStream::connect(&sock)?;
                send_with_fds(&stream, b"daemon-state", &fds)
            })
            .unwrap_err();
        assert!(format!("{:#}", err).contains("truncated"));
        assert!(!su.has_states());
        Ok(())
    }

    #[test]
    fn test_saved_states_unlocked_while_serving() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Arc::new(Supervisor::new("d1", &path).with_timeout(Duration::from_secs(5)));
        let sock = path.clone();
        su.fetch_daemon_states(&|| {
            let stream = UnixStream::connect(&sock)?;
            send_with_fds(&stream, b"daemon-state", &[])
        })?;

        let sender = {
            let su = su.clone();
            thread::spawn(move || su.send_states())
        };
        thread::sleep(Duration::from_millis(50));
        // Still waiting for a successor, inspection must not block.
        assert!(su.has_states());
        assert_eq!(su.fd_count(), 0);

        let stream = connect_retry(&path);
        let received = recv_with_fds(&stream)?;
        sender.join().unwrap()?;
        assert_eq!(received.data, b"daemon-state");
        Ok(())
    }

    #[test]
    fn test_send_without_states_fails() {
        let dir = tempfile::tempdir().unwrap();
        let su = Supervisor::new("d1", dir.path().join("supervisor.sock"));
        assert!(su.send_states().is_err());
    }

    #[test]
    fn test_peer_closing_early() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("supervisor.sock");
        let su = Supervisor::new("d1", &path).with_timeout(Duration::from_secs(2));
        let err = su
            .fetch_daemon_states(&|| {
                drop(UnixStream::connect(&path)?);
                Ok(())
            })
            .unwrap_err();
        assert!(format!("{:#}", err).contains("peer closed"));
        Ok(())
    }
}
