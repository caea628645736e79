//! The transport underneath a [`Worker`](crate::worker::Worker): a Unix
//! domain socket carrying length-prefixed frames, plus a pair of named,
//! interprocess locks guarding each frame's production and consumption.
//!
//! `zng-task`'s `ipc.rs` leans on `ipc_channel`, which hides its own wire
//! format; the polkadot-sdk pvf worker (`execute-worker/src/lib.rs`,
//! `framed_send_blocking`/`framed_recv_blocking`) is the closer model here —
//! a raw `UnixStream` with an explicit `u32` length prefix. `UnixStream` also
//! gives us `set_read_timeout`/`peek`, which a plain OS pipe does not, so
//! `poll`/`recv` can be implemented without a helper thread.
//!
//! The locks are deliberately **not** OS advisory locks (`flock` et al. are
//! released automatically when the holding process dies or closes the fd,
//! which would make a worker's death mid-frame invisible). They are plain
//! lock files: exclusive-create to acquire, remove to release. A process that
//! dies while holding one leaves the file behind, and the peer's next
//! acquisition attempt simply times out — this timeout is the sole liveness
//! signal.

use std::{
    io::{self, Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::ChannelError;

fn lock_path(sock_path: &Path, suffix: &str) -> PathBuf {
    let mut name = sock_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// A named, interprocess mutex backed by exclusive file creation.
///
/// Unlike `flock`, holding this lock survives the holder's death: nothing
/// releases it but an explicit [`NamedMutex::release`] or [`MutexGuard`] drop.
struct NamedMutex {
    path: PathBuf,
}
impl NamedMutex {
    fn new(path: PathBuf) -> Self {
        NamedMutex { path }
    }

    fn acquire(&self, timeout: Duration) -> Result<MutexGuard<'_>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(_file) => return Ok(MutexGuard { path: &self.path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(ChannelError::broken(format!(
                            "lock {:?} still held after {:?}, peer likely died mid-frame",
                            self.path, timeout
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(ChannelError::broken(format!("lock file {:?} io error, {e}", self.path))),
            }
        }
    }
}

struct MutexGuard<'a> {
    path: &'a Path,
}
impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.path);
    }
}

/// Length-prefixed, lock-guarded channel between the supervisor and one
/// worker process. Both ends are symmetric: whichever side is sending
/// acquires `writer_lock`, whichever side is consuming acquires `reader_lock`.
pub(crate) struct Channel {
    stream: UnixStream,
    reader_lock: NamedMutex,
    writer_lock: NamedMutex,
    lock_timeout: Duration,
}
impl Channel {
    /// Supervisor side: accept the one connection a freshly spawned worker
    /// makes, bounded by `accept_timeout`.
    pub(crate) fn accept(listener: &UnixListener, accept_timeout: Duration, sock_path: &Path, lock_timeout: Duration) -> io::Result<Self> {
        listener.set_nonblocking(false)?;
        let deadline = Instant::now() + accept_timeout;
        loop {
            listener.set_nonblocking(true)?;
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Self::new(stream, sock_path, lock_timeout));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "worker never connected"));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Worker side: connect to the supervisor's listening socket.
    pub(crate) fn connect(sock_path: &Path, lock_timeout: Duration) -> io::Result<Self> {
        let stream = UnixStream::connect(sock_path)?;
        Ok(Self::new(stream, sock_path, lock_timeout))
    }

    fn new(stream: UnixStream, sock_path: &Path, lock_timeout: Duration) -> Self {
        Channel {
            stream,
            reader_lock: NamedMutex::new(lock_path(sock_path, ".rlock")),
            writer_lock: NamedMutex::new(lock_path(sock_path, ".wlock")),
            lock_timeout,
        }
    }

    /// Non-consuming readability check, bounded by `timeout`. `Ok(false)`
    /// means "nothing pending yet", not an error.
    pub(crate) fn poll(&self, timeout: Duration) -> Result<bool, ChannelError> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| ChannelError::broken(format!("set_read_timeout, {e}")))?;
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(0) => Err(ChannelError::broken("peer closed the channel")),
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(ChannelError::broken(format!("poll io error, {e}"))),
        }
    }

    /// Send one frame: acquire the writer lock, write the length prefix and
    /// payload, release.
    pub(crate) fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let _guard = self.writer_lock.acquire(self.lock_timeout)?;
        self.stream
            .set_write_timeout(None)
            .map_err(|e| ChannelError::broken(format!("set_write_timeout, {e}")))?;
        let len = u32::try_from(payload.len()).map_err(|_| ChannelError::broken("frame too large to encode"))?;
        self.stream.write_all(&len.to_be_bytes()).map_err(|e| ChannelError::broken(format!("send io error, {e}")))?;
        self.stream.write_all(payload).map_err(|e| ChannelError::broken(format!("send io error, {e}")))?;
        self.stream.flush().map_err(|e| ChannelError::broken(format!("send io error, {e}")))?;
        Ok(())
    }

    /// `poll(timeout)` then, if a frame is pending, acquire the reader lock
    /// (bounded by the channel's `lock_timeout`) and consume it whole.
    /// `Err(ChannelError::Empty)` means no frame arrived within `timeout`.
    pub(crate) fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if !self.poll(timeout)? {
            return Err(ChannelError::Empty);
        }
        let _guard = self.reader_lock.acquire(self.lock_timeout)?;
        self.stream
            .set_read_timeout(None)
            .map_err(|e| ChannelError::broken(format!("set_read_timeout, {e}")))?;
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(|e| ChannelError::broken(format!("recv io error, {e}")))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).map_err(|e| ChannelError::broken(format!("short frame, {e}")))?;
        Ok(payload)
    }

    pub(crate) fn send_value<T: Serialize>(&mut self, value: &T) -> Result<(), ChannelError> {
        let payload = bincode::serialize(value).map_err(|e| ChannelError::broken(format!("encode error, {e}")))?;
        self.send(&payload)
    }

    pub(crate) fn recv_value<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<T, ChannelError> {
        let payload = self.recv(timeout)?;
        bincode::deserialize(&payload).map_err(|e| ChannelError::broken(format!("decode error, {e}")))
    }

    /// Path of the listening socket this channel's peer was told to connect
    /// to; workers read it back out of `PROCPOOL_SOCK` (see [`crate::worker`]).
    pub(crate) fn writer_lock_path(sock_path: &Path) -> PathBuf {
        lock_path(sock_path, ".wlock")
    }
    pub(crate) fn reader_lock_path(sock_path: &Path) -> PathBuf {
        lock_path(sock_path, ".rlock")
    }
}

/// Test-only hook letting an end-to-end test simulate "a worker died while
/// holding the writer/reader lock": create the lock file and never release
/// it, deterministically reproducing a worker dying mid-frame without racing
/// a real crash against a real frame write.
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::lock_path;
    use std::path::Path;

    pub fn poison_writer_lock(sock_path: &Path) {
        let _ = std::fs::OpenOptions::new().write(true).create_new(true).open(lock_path(sock_path, ".wlock"));
    }

    pub fn poison_reader_lock(sock_path: &Path) {
        let _ = std::fs::OpenOptions::new().write(true).create_new(true).open(lock_path(sock_path, ".rlock"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("procpool-test-{tag}-{}.sock", std::process::id()))
    }

    #[test]
    fn round_trip_send_recv() {
        let path = sock_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let mut client = Channel::connect(&path, Duration::from_secs(1)).unwrap();
        let mut server = Channel::accept(&listener, Duration::from_secs(1), &path, Duration::from_secs(1)).unwrap();

        client.send(b"hello").unwrap();
        let got = server.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(got, b"hello");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recv_times_out_when_nothing_pending() {
        let path = sock_path("empty");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let _client = Channel::connect(&path, Duration::from_secs(1)).unwrap();
        let mut server = Channel::accept(&listener, Duration::from_secs(1), &path, Duration::from_secs(1)).unwrap();

        assert!(matches!(server.recv(Duration::from_millis(20)), Err(ChannelError::Empty)));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn poisoned_writer_lock_times_out_send() {
        let path = sock_path("poison-writer");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let _peer = Channel::connect(&path, Duration::from_secs(1)).unwrap();
        let mut server = Channel::accept(&listener, Duration::from_secs(1), &path, Duration::from_millis(50)).unwrap();

        testing::poison_writer_lock(&path);
        let err = server.send(b"x").unwrap_err();
        assert!(matches!(err, ChannelError::Broken(_)));

        let _ = std::fs::remove_file(Channel::writer_lock_path(&path));
        let _ = std::fs::remove_file(&path);
    }
}
