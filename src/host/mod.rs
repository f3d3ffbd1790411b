//! Host communication: framing, message codec, socket client, and the
//! comms manager bridging nanoapps to the host processor.

pub mod client;
pub mod comms;
pub mod frame;
pub mod protocol;

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::event::AppId;

pub use client::{ClientCallbacks, ReconnectPolicy, SocketClient};
pub use comms::{HostCommsManager, HostMessage, MessageFreeCallback};
pub use frame::{FrameError, FrameReader, FrameWriter, encode_frame};
pub use protocol::{
    HOST_ENDPOINT_UNSPECIFIED, HubInfoResponse, HubMessage, LogEntry, LogLevel, MessageContainer,
    NanoappListEntry,
};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
    #[error(transparent)]
    Codec(#[from] protocol::CodecError),
    #[error("no host link connected")]
    NotConnected,
    #[error("message exceeds max length: max {max} got {got}")]
    MessageTooLarge { max: usize, got: usize },
    #[error("reconnect abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("no loaded nanoapp with app id {0}")]
    UnknownApp(AppId),
    #[error("no nanoapp hook is executing")]
    NoCurrentNanoapp,
    #[error("unexpected {0} message from host")]
    UnexpectedMessage(&'static str),
}

/// Outbound transport for host-bound payloads. Implementations own their
/// framing; callers hand over one message payload at a time.
pub trait HostLink: Send {
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), HostError>;
}

/// A [`HostLink`] that can be wired up after runtime construction.
///
/// The socket client's receive callbacks need the runtime context, so the
/// real link necessarily comes up second; the runtime starts against an
/// empty slot and the embedder binds the transport once it exists.
#[derive(Clone, Default)]
pub struct LinkSlot {
    inner: Arc<Mutex<Option<Box<dyn HostLink>>>>,
}

impl LinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, link: Box<dyn HostLink>) {
        *self.inner.lock().unwrap_or_else(|err| err.into_inner()) = Some(link);
    }

    pub fn unbind(&self) {
        *self.inner.lock().unwrap_or_else(|err| err.into_inner()) = None;
    }
}

impl HostLink for LinkSlot {
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), HostError> {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        match guard.as_mut() {
            Some(link) => link.send_frame(payload),
            None => Err(HostError::NotConnected),
        }
    }
}
