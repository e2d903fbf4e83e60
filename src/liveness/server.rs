//! Unix-socket server feeding client messages into the [`LivenessChannel`].
//!
//! One accept thread polls a non-blocking listener against a shutdown flag; each
//! connection gets its own reader thread named after the client (`client-<n>`).

#![allow(missing_docs)]

use std::fs;
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::errors::{Result, WatchdogError};
use crate::liveness::channel::LivenessChannel;
use crate::liveness::protocol::MAX_LINE_BYTES;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Accept-loop sleep when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Read timeout so connection threads notice shutdown.
const READ_POLL: Duration = Duration::from_millis(250);

/// Running liveness socket server. Stops (and removes its socket) on drop.
#[derive(Debug)]
pub struct LivenessServer {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl LivenessServer {
    /// Bind `socket_path` (mode 0600) and start accepting clients.
    ///
    /// A stale socket file left by a dead daemon is replaced; a live one is an error.
    pub fn bind(
        socket_path: &Path,
        channel: Arc<LivenessChannel>,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|source| WatchdogError::io(parent, source))?;
        }

        if socket_path.exists() {
            if UnixStream::connect(socket_path).is_ok() {
                return Err(WatchdogError::Runtime {
                    details: format!(
                        "liveness socket {} is already served by another process",
                        socket_path.display()
                    ),
                });
            }
            fs::remove_file(socket_path).map_err(|source| WatchdogError::io(socket_path, source))?;
        }

        let listener =
            UnixListener::bind(socket_path).map_err(|source| WatchdogError::io(socket_path, source))?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
            .map_err(|source| WatchdogError::io(socket_path, source))?;
        listener
            .set_nonblocking(true)
            .map_err(|source| WatchdogError::io(socket_path, source))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("appwd-liveness".to_string())
            .spawn(move || accept_loop(&listener, &channel, &logger, &flag))
            .map_err(|e| WatchdogError::Runtime {
                details: format!("failed to spawn liveness accept thread: {e}"),
            })?;

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, join all connection threads, remove the socket. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for LivenessServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: &UnixListener,
    channel: &Arc<LivenessChannel>,
    logger: &ActivityLoggerHandle,
    shutdown: &Arc<AtomicBool>,
) {
    let next_client = AtomicU64::new(1);
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let client = format!("client-{}", next_client.fetch_add(1, Ordering::Relaxed));
                let channel = Arc::clone(channel);
                let logger_for_thread = logger.clone();
                let flag = Arc::clone(shutdown);
                let spawned = thread::Builder::new().name(client.clone()).spawn(move || {
                    serve_client(stream, &client, &channel, &logger_for_thread, &flag);
                });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(e) => logger.send(ActivityEvent::Error {
                        code: "WD-3900".to_string(),
                        message: format!("failed to spawn liveness connection thread: {e}"),
                    }),
                }
                connections.retain(|handle| !handle.is_finished());
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                logger.send(ActivityEvent::Error {
                    code: "WD-3002".to_string(),
                    message: format!("liveness accept failed: {e}"),
                });
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    for handle in connections {
        let _ = handle.join();
    }
}

fn serve_client(
    stream: UnixStream,
    client: &str,
    channel: &LivenessChannel,
    logger: &ActivityLoggerHandle,
    shutdown: &AtomicBool,
) {
    // Accepted sockets inherit non-blocking mode on some platforms.
    if stream.set_nonblocking(false).is_err() || stream.set_read_timeout(Some(READ_POLL)).is_err()
    {
        return;
    }
    channel.client_connected(client);

    let mut reader = BufReader::new(stream);
    let mut buf: Vec<u8> = Vec::with_capacity(128);
    while !shutdown.load(Ordering::SeqCst) {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    let line = String::from_utf8_lossy(&buf);
                    // Parse failures are already logged by the channel.
                    let _ = channel.handle_message(client, &line);
                    buf.clear();
                } else if buf.len() > MAX_LINE_BYTES {
                    discard_oversized(client, &mut buf, logger);
                }
                // No newline and under the limit: EOF follows on the next read.
            }
            Err(e) if is_timeout(&e) => {
                if buf.len() > MAX_LINE_BYTES {
                    discard_oversized(client, &mut buf, logger);
                }
            }
            Err(_) => break,
        }
    }

    // A final unterminated line still counts.
    if !buf.is_empty() && buf.len() <= MAX_LINE_BYTES {
        let line = String::from_utf8_lossy(&buf);
        let _ = channel.handle_message(client, &line);
    }
    channel.client_disconnected(client);
}

fn discard_oversized(client: &str, buf: &mut Vec<u8>, logger: &ActivityLoggerHandle) {
    logger.send(ActivityEvent::ProtocolError {
        client: client.to_string(),
        message: format!("line exceeds {MAX_LINE_BYTES} bytes, discarded"),
    });
    buf.clear();
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn heartbeat_over_socket_reaches_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("live.sock");
        let (channel, rx) = LivenessChannel::new(16, ActivityLoggerHandle::discard());
        let channel = Arc::new(channel);
        let mut server =
            LivenessServer::bind(&path, Arc::clone(&channel), ActivityLoggerHandle::discard())
                .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"1,4242\n").unwrap();
        let signal = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(signal.pid, 4242);
        assert!(signal.client.starts_with("client-"));
        assert!(channel.connected(4242));

        drop(stream);
        assert!(wait_for(|| !channel.connected(4242)));

        server.stop();
        assert!(!path.exists());
    }

    #[test]
    fn garbage_does_not_close_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let (channel, rx) = LivenessChannel::new(16, ActivityLoggerHandle::discard());
        let channel = Arc::new(channel);
        let _server =
            LivenessServer::bind(&path, Arc::clone(&channel), ActivityLoggerHandle::discard())
                .unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"hello\n0,1\n1,77\n").unwrap();
        let signal = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(signal.pid, 77);
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        {
            let _stale = UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());
        let (channel, _rx) = LivenessChannel::new(4, ActivityLoggerHandle::discard());
        let server = LivenessServer::bind(&path, Arc::new(channel), ActivityLoggerHandle::discard());
        assert!(server.is_ok());
    }

    #[test]
    fn live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let (first, _rx1) = LivenessChannel::new(4, ActivityLoggerHandle::discard());
        let _server =
            LivenessServer::bind(&path, Arc::new(first), ActivityLoggerHandle::discard()).unwrap();
        let (second, _rx2) = LivenessChannel::new(4, ActivityLoggerHandle::discard());
        let err = LivenessServer::bind(&path, Arc::new(second), ActivityLoggerHandle::discard())
            .unwrap_err();
        assert_eq!(err.code(), "WD-3900");
    }
}
