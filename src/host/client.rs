//! Socket client connecting the runtime to the host daemon.
//!
//! A dedicated receive thread reads frames and hands payloads to the
//! callbacks. When the remote side drops, the thread reconnects with
//! exponential backoff; an explicit disconnect aborts the wait promptly by
//! signalling through the shutdown channel the backoff sleeps on.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, info, warn};

use super::frame::{FrameReader, encode_frame};
use super::{HostError, HostLink};

/// Backoff schedule for reconnect attempts.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5 * 60),
            max_attempts: 40,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (zero-based): the initial delay
    /// doubled per prior failure, capped at the maximum.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Receive-side hooks. All callbacks run on the receive thread.
pub trait ClientCallbacks: Send {
    fn on_message(&mut self, payload: &[u8]);

    /// Called after every successful (re)connection.
    fn on_connected(&mut self) {}

    /// The remote closed or errored; a reconnect follows (policy allowing).
    fn on_disconnected_by_remote(&mut self) {}

    /// Reconnection was abandoned after exhausting the policy.
    fn on_connection_aborted(&mut self) {}
}

/// Cloneable outbound half; frames payloads onto the current stream.
#[derive(Clone)]
pub struct FrameSender {
    stream: Arc<Mutex<Option<UnixStream>>>,
    max_frame_bytes: usize,
}

impl HostLink for FrameSender {
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), HostError> {
        use std::io::Write;

        let frame = encode_frame(payload, self.max_frame_bytes)?;
        let mut guard = self.stream.lock().unwrap_or_else(|err| err.into_inner());
        let Some(stream) = guard.as_mut() else {
            return Err(HostError::NotConnected);
        };
        stream.write_all(&frame).map_err(|err| {
            error!(%err, "host socket send failed");
            HostError::Io(err)
        })
    }
}

pub struct SocketClient {
    stream: Arc<Mutex<Option<UnixStream>>>,
    shutdown_tx: Sender<()>,
    max_frame_bytes: usize,
    rx_thread: Option<JoinHandle<()>>,
}

impl SocketClient {
    /// Connect and spawn the receive thread. The initial connection must
    /// succeed; only later drops go through the reconnect policy.
    pub fn connect(
        path: impl Into<PathBuf>,
        callbacks: Box<dyn ClientCallbacks>,
        policy: ReconnectPolicy,
        max_frame_bytes: usize,
    ) -> Result<SocketClient, HostError> {
        let path = path.into();
        let stream = UnixStream::connect(&path)?;
        let reader = stream.try_clone()?;
        let shared = Arc::new(Mutex::new(Some(stream)));
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let thread_shared = Arc::clone(&shared);
        let rx_thread = std::thread::Builder::new()
            .name("host-socket-rx".into())
            .spawn(move || {
                receive_loop(
                    reader,
                    thread_shared,
                    shutdown_rx,
                    callbacks,
                    policy,
                    path,
                    max_frame_bytes,
                );
            })?;

        Ok(SocketClient {
            stream: shared,
            shutdown_tx,
            max_frame_bytes,
            rx_thread: Some(rx_thread),
        })
    }

    /// Outbound handle, independent of this client's lifetime management.
    pub fn frame_sender(&self) -> FrameSender {
        FrameSender {
            stream: Arc::clone(&self.stream),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    /// Graceful shutdown: wakes the receive thread out of a blocking read
    /// or a backoff wait and joins it.
    pub fn disconnect(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(stream) = self
            .stream
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(thread) = self.rx_thread.take() {
            debug!("waiting for host socket receive thread");
            let _ = thread.join();
        }
    }
}

fn receive_loop(
    mut reader: UnixStream,
    shared: Arc<Mutex<Option<UnixStream>>>,
    shutdown_rx: Receiver<()>,
    mut callbacks: Box<dyn ClientCallbacks>,
    policy: ReconnectPolicy,
    path: PathBuf,
    max_frame_bytes: usize,
) {
    debug!("host socket receive thread started");
    loop {
        callbacks.on_connected();
        read_until_disconnect(&mut reader, callbacks.as_mut(), max_frame_bytes);
        *shared.lock().unwrap_or_else(|err| err.into_inner()) = None;

        if shutdown_requested(&shutdown_rx) {
            break;
        }
        callbacks.on_disconnected_by_remote();

        match reconnect(&shutdown_rx, &policy, &path) {
            Reconnect::Stream(stream) => {
                match stream.try_clone() {
                    Ok(clone) => {
                        *shared.lock().unwrap_or_else(|err| err.into_inner()) = Some(stream);
                        reader = clone;
                        info!("host socket reconnected");
                    }
                    Err(err) => {
                        error!(%err, "could not clone reconnected socket");
                        callbacks.on_connection_aborted();
                        break;
                    }
                }
            }
            Reconnect::ShutdownRequested => break,
            Reconnect::Exhausted => {
                warn!(
                    attempts = policy.max_attempts,
                    "giving up on host socket reconnection"
                );
                callbacks.on_connection_aborted();
                break;
            }
        }
    }
    debug!("host socket receive thread exiting");
}

fn read_until_disconnect(
    stream: &mut UnixStream,
    callbacks: &mut dyn ClientCallbacks,
    max_frame_bytes: usize,
) {
    let mut frames = FrameReader::new(stream, max_frame_bytes);
    loop {
        match frames.read_next() {
            Ok(Some(payload)) => callbacks.on_message(&payload),
            Ok(None) => {
                info!("host socket closed by remote");
                return;
            }
            Err(err) => {
                warn!(%err, "host socket read failed");
                return;
            }
        }
    }
}

enum Reconnect {
    Stream(UnixStream),
    ShutdownRequested,
    Exhausted,
}

fn reconnect(shutdown_rx: &Receiver<()>, policy: &ReconnectPolicy, path: &Path) -> Reconnect {
    for attempt in 0..policy.max_attempts {
        let delay = policy.delay_for_attempt(attempt);
        match shutdown_rx.recv_timeout(delay) {
            Ok(()) => return Reconnect::ShutdownRequested,
            Err(RecvTimeoutError::Disconnected) => return Reconnect::ShutdownRequested,
            Err(RecvTimeoutError::Timeout) => {}
        }
        match UnixStream::connect(path) {
            Ok(stream) => return Reconnect::Stream(stream),
            Err(err) => {
                debug!(%err, attempt, ?delay, "host socket reconnect attempt failed");
            }
        }
    }
    Reconnect::Exhausted
}

fn shutdown_requested(shutdown_rx: &Receiver<()>) -> bool {
    match shutdown_rx.try_recv() {
        Ok(()) => true,
        Err(crossbeam::channel::TryRecvError::Disconnected) => true,
        Err(crossbeam::channel::TryRecvError::Empty) => false,
    }
}
