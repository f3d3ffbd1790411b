//! Host communications manager: the bridge between nanoapps and the host
//! processor.
//!
//! Outbound nanoapp messages are framed and written to the link on the
//! calling (loop) thread; each message's free callback then rides a system
//! event so it runs on the loop thread during the next distribution pass.
//! Inbound host requests arrive on the socket receive thread and are
//! answered there, posting events or loop commands as needed; requests are
//! handled strictly serially, so at most one debug-dump session can exist
//! at a time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::event::{AppId, InstanceId, event_type};
use crate::core::event_loop::{LoopCommand, NanoappSummary};
use crate::core::inbound::EventSender;
use crate::core::time::SharedClock;

use super::protocol::{
    self, HubInfoResponse, HubMessage, LogEntry, LogLevel, MessageContainer, NanoappListEntry,
};
use super::{HostError, HostLink};

/// Returns the message payload to the nanoapp's allocator context.
pub type MessageFreeCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Payload of [`event_type::MESSAGE_FROM_HOST`] events.
#[derive(Debug)]
pub struct HostMessage {
    pub message_type: u32,
    pub host_endpoint: u16,
    pub data: Vec<u8>,
}

struct PendingMessage {
    app_id: AppId,
    instance_id: InstanceId,
    payload: Vec<u8>,
    free_callback: Option<MessageFreeCallback>,
}

type SharedLink = Arc<Mutex<Box<dyn HostLink>>>;

pub struct HostCommsManager {
    sender: EventSender,
    control_tx: Sender<LoopCommand>,
    registry: Arc<Mutex<Vec<NanoappSummary>>>,
    /// Own lock so replies can be sent without holding the manager itself
    /// (the unload path answers from a waiter thread).
    link: SharedLink,
    clock: SharedClock,
    hub_info: HubInfoResponse,
    max_msg_len: usize,
    /// Messages accepted while the link was down; their free callbacks are
    /// owed and run at flush time.
    pending: Vec<PendingMessage>,
    log_buffer: Vec<LogEntry>,
    log_buffer_max: usize,
    /// Host-measured AP-minus-hub offset from the latest time sync.
    time_offset_ns: i64,
}

impl HostCommsManager {
    pub fn new(
        sender: EventSender,
        control_tx: Sender<LoopCommand>,
        registry: Arc<Mutex<Vec<NanoappSummary>>>,
        link: Box<dyn HostLink>,
        clock: SharedClock,
        config: &Config,
    ) -> Self {
        let info = &config.hub_info;
        let hub_info = HubInfoResponse {
            name: info.name.clone(),
            vendor: info.vendor.clone(),
            toolchain: info.toolchain.clone(),
            platform_version: info.platform_version,
            toolchain_version: info.toolchain_version,
            peak_mips: info.peak_mips,
            stopped_power_mw: info.stopped_power_mw,
            sleep_power_mw: info.sleep_power_mw,
            peak_power_mw: info.peak_power_mw,
            max_msg_len: config.limits.max_msg_len as u32,
            platform_id: info.platform_id,
            chre_platform_version: info.platform_api_version,
        };
        Self {
            sender,
            control_tx,
            registry,
            link: Arc::new(Mutex::new(link)),
            clock,
            hub_info,
            max_msg_len: config.limits.max_msg_len,
            pending: Vec::new(),
            log_buffer: Vec::new(),
            log_buffer_max: config.limits.log_buffer_max_records,
            time_offset_ns: 0,
        }
    }

    /// Send a nanoapp message to the host.
    ///
    /// On success (and on a dropped-link failure, where the message parks
    /// in the pending list) the free callback is owed exactly once, on the
    /// loop thread.
    pub fn send_message_to_host(
        &mut self,
        instance_id: InstanceId,
        app_id: AppId,
        message_type: u32,
        host_endpoint: u16,
        payload: Vec<u8>,
        free_callback: Option<MessageFreeCallback>,
    ) -> Result<(), HostError> {
        if payload.len() > self.max_msg_len {
            return Err(HostError::MessageTooLarge {
                max: self.max_msg_len,
                got: payload.len(),
            });
        }

        let container = MessageContainer {
            client_id: 0,
            message: HubMessage::NanoappMessage {
                app_id: app_id.0,
                message_type,
                host_endpoint,
                message: payload.clone(),
            },
        };
        let bytes = protocol::encode_container(&container)?;
        let sent = self
            .link
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .send_frame(&bytes);
        match sent {
            Ok(()) => {
                self.queue_free(instance_id, payload, free_callback);
                Ok(())
            }
            Err(HostError::NotConnected) => {
                // No transport yet: accept the message so the nanoapp's
                // ownership contract holds, deliver nothing.
                debug!(%app_id, "host link down; message parked");
                self.pending.push(PendingMessage {
                    app_id,
                    instance_id,
                    payload,
                    free_callback,
                });
                Ok(())
            }
            Err(err) => {
                warn!(%app_id, %err, "host message send failed");
                self.queue_free(instance_id, payload, free_callback);
                Err(err)
            }
        }
    }

    /// Ensure every message this nanoapp has sent at least has its free
    /// callback pending in the event queue. Part of the unload sequence.
    pub fn flush_messages_sent_by(&mut self, app_id: AppId) {
        let mut kept = Vec::with_capacity(self.pending.len());
        for message in self.pending.drain(..) {
            if message.app_id == app_id {
                warn!(%app_id, "dropping undelivered host message at flush");
                queue_free_on(
                    &self.sender,
                    message.instance_id,
                    message.payload,
                    message.free_callback,
                );
            } else {
                kept.push(message);
            }
        }
        self.pending = kept;
    }

    /// Decode and handle one inbound frame body from the host.
    pub fn handle_host_message(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        let container = protocol::decode_container(bytes)?;
        let client_id = container.client_id;
        match container.message {
            HubMessage::NanoappMessage {
                app_id,
                message_type,
                host_endpoint,
                message,
            } => self.deliver_to_nanoapp(AppId(app_id), message_type, host_endpoint, message),
            HubMessage::HubInfoRequest => self.reply(
                client_id,
                HubMessage::HubInfoResponse(self.hub_info.clone()),
            ),
            HubMessage::NanoappListRequest => {
                let apps = self
                    .registry
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .iter()
                    .map(|summary| NanoappListEntry {
                        app_id: summary.app_id.0,
                        version: summary.version,
                        enabled: true,
                        is_system: summary.is_system,
                    })
                    .collect();
                self.reply(client_id, HubMessage::NanoappListResponse { apps })
            }
            HubMessage::LoadNanoappRequest { transaction_id, app_id, .. } => {
                // Binary loading is delegated to the build; nanoapps are
                // registered by the embedder.
                warn!(app_id = %AppId(app_id), "rejecting dynamic nanoapp load request");
                self.reply(
                    client_id,
                    HubMessage::LoadNanoappResponse {
                        transaction_id,
                        success: false,
                    },
                )
            }
            HubMessage::UnloadNanoappRequest {
                transaction_id,
                app_id,
                allow_system_nanoapp_unload,
            } => self.request_unload(
                client_id,
                transaction_id,
                AppId(app_id),
                allow_system_nanoapp_unload,
            ),
            HubMessage::TimeSyncMessage { offset_ns } => {
                debug!(offset_ns, "time sync offset updated");
                self.time_offset_ns = offset_ns;
                Ok(())
            }
            HubMessage::DebugDumpRequest => {
                let dump = self.debug_dump();
                self.reply(client_id, HubMessage::DebugDumpData { data: dump })?;
                self.reply(
                    client_id,
                    HubMessage::DebugDumpResponse {
                        success: true,
                        data_count: 1,
                    },
                )
            }
            HubMessage::HubInfoResponse(_) => Err(HostError::UnexpectedMessage("hub_info_response")),
            HubMessage::NanoappListResponse { .. } => {
                Err(HostError::UnexpectedMessage("nanoapp_list_response"))
            }
            HubMessage::LoadNanoappResponse { .. } => {
                Err(HostError::UnexpectedMessage("load_nanoapp_response"))
            }
            HubMessage::UnloadNanoappResponse { .. } => {
                Err(HostError::UnexpectedMessage("unload_nanoapp_response"))
            }
            HubMessage::LogMessage { .. } => Err(HostError::UnexpectedMessage("log_message")),
            HubMessage::TimeSyncRequest => Err(HostError::UnexpectedMessage("time_sync_request")),
            HubMessage::DebugDumpData { .. } => {
                Err(HostError::UnexpectedMessage("debug_dump_data"))
            }
            HubMessage::DebugDumpResponse { .. } => {
                Err(HostError::UnexpectedMessage("debug_dump_response"))
            }
        }
    }

    /// Buffer a log record for relay; flushes automatically at capacity.
    pub fn relay_log(&mut self, level: LogLevel, message: String) {
        self.log_buffer.push(LogEntry {
            level,
            timestamp_ns: self.clock.now().as_u64(),
            message,
        });
        if self.log_buffer.len() >= self.log_buffer_max {
            let _ = self.flush_logs();
        }
    }

    /// Relay buffered log records to the host. The buffer is surrendered
    /// either way; log relay is best-effort.
    pub fn flush_logs(&mut self) -> Result<(), HostError> {
        if self.log_buffer.is_empty() {
            return Ok(());
        }
        let buffer = protocol::pack_log_entries(&self.log_buffer);
        self.log_buffer.clear();
        self.reply(0, HubMessage::LogMessage { buffer })
            .inspect_err(|err| debug!(%err, "log relay failed"))
    }

    pub fn send_time_sync_request(&mut self) -> Result<(), HostError> {
        self.reply(0, HubMessage::TimeSyncRequest)
    }

    pub fn time_offset_ns(&self) -> i64 {
        self.time_offset_ns
    }

    pub fn pending_message_count(&self) -> usize {
        self.pending.len()
    }

    fn deliver_to_nanoapp(
        &mut self,
        app_id: AppId,
        message_type: u32,
        host_endpoint: u16,
        data: Vec<u8>,
    ) -> Result<(), HostError> {
        let instance_id = self
            .registry
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .find(|summary| summary.app_id == app_id)
            .map(|summary| summary.instance_id);
        let Some(instance_id) = instance_id else {
            warn!(%app_id, "dropping host message for unloaded nanoapp");
            return Err(HostError::UnknownApp(app_id));
        };

        let payload = Box::new(HostMessage {
            message_type,
            host_endpoint,
            data,
        });
        if let Err(err) = self.sender.post_event(
            event_type::MESSAGE_FROM_HOST,
            Some(payload),
            None,
            InstanceId::SYSTEM,
            instance_id,
        ) {
            warn!(%instance_id, %err, "failed to post host message event");
        }
        Ok(())
    }

    /// Forward an unload request to the loop and answer the host once it
    /// resolves. The wait happens on a detached thread: the loop takes
    /// this manager's lock during the unload's host-message flush, so the
    /// receive thread must not sit on it while waiting.
    fn request_unload(
        &self,
        client_id: u16,
        transaction_id: u32,
        app_id: AppId,
        allow_system_unload: bool,
    ) -> Result<(), HostError> {
        let respond = move |link: &SharedLink, success: bool| {
            send_on_link(
                link,
                client_id,
                HubMessage::UnloadNanoappResponse {
                    transaction_id,
                    success,
                },
            )
        };

        let instance_id = self
            .registry
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .find(|summary| summary.app_id == app_id)
            .map(|summary| summary.instance_id);
        let Some(instance_id) = instance_id else {
            warn!(%app_id, "unload request for unknown nanoapp");
            return respond(&self.link, false);
        };

        let (reply, reply_rx) = crossbeam::channel::bounded(1);
        if self
            .control_tx
            .send(LoopCommand::UnloadNanoapp {
                instance_id,
                allow_system_unload,
                reply,
            })
            .is_err()
        {
            return respond(&self.link, false);
        }
        self.sender.post_wake();

        let link = Arc::clone(&self.link);
        let waiter = std::thread::Builder::new()
            .name("unload-response".into())
            .spawn(move || {
                let success = match reply_rx.recv_timeout(Duration::from_secs(10)) {
                    Ok(result) => result.is_ok(),
                    Err(_) => {
                        warn!(%instance_id, "unload request timed out");
                        false
                    }
                };
                if let Err(err) = respond(&link, success) {
                    warn!(%err, "failed to send unload response");
                }
            });
        waiter?;
        Ok(())
    }

    fn debug_dump(&self) -> Vec<u8> {
        use std::fmt::Write;

        let mut dump = String::new();
        let _ = writeln!(dump, "time_offset_ns: {}", self.time_offset_ns);
        let _ = writeln!(dump, "pending_host_messages: {}", self.pending.len());
        let registry = self.registry.lock().unwrap_or_else(|err| err.into_inner());
        let _ = writeln!(dump, "nanoapps: {}", registry.len());
        for summary in registry.iter() {
            let _ = writeln!(
                dump,
                "  {} instance={} version={} system={}",
                summary.app_id, summary.instance_id, summary.version, summary.is_system
            );
        }
        dump.into_bytes()
    }

    fn queue_free(
        &self,
        instance_id: InstanceId,
        payload: Vec<u8>,
        free_callback: Option<MessageFreeCallback>,
    ) {
        queue_free_on(&self.sender, instance_id, payload, free_callback);
    }

    fn reply(&self, client_id: u16, message: HubMessage) -> Result<(), HostError> {
        send_on_link(&self.link, client_id, message)
    }
}

fn send_on_link(link: &SharedLink, client_id: u16, message: HubMessage) -> Result<(), HostError> {
    let bytes = protocol::encode_container(&MessageContainer { client_id, message })?;
    link.lock()
        .unwrap_or_else(|err| err.into_inner())
        .send_frame(&bytes)
}

/// Hand a message's payload back through its free callback on the loop
/// thread, by riding a system event. The callback runs exactly once: if
/// the event cannot be queued it runs inline instead (the callers are on
/// the loop thread already).
fn queue_free_on(
    sender: &EventSender,
    instance_id: InstanceId,
    payload: Vec<u8>,
    free_callback: Option<MessageFreeCallback>,
) {
    let Some(callback) = free_callback else {
        return;
    };
    // The slot survives a failed post, where the event (and the closure it
    // swallowed) is dropped before ever running.
    let slot = Arc::new(Mutex::new(Some((payload, callback))));
    let event_slot = Arc::clone(&slot);
    let result = sender.post_event(
        event_type::MESSAGE_FREE,
        None,
        Some(Box::new(move |_event_type, _payload| {
            let taken = event_slot.lock().unwrap_or_else(|err| err.into_inner()).take();
            if let Some((payload, callback)) = taken {
                callback(payload);
            }
        })),
        instance_id,
        InstanceId::SYSTEM,
    );
    if let Err(err) = result {
        debug!(%instance_id, %err, "free event not queued; running callback inline");
        let taken = slot.lock().unwrap_or_else(|err| err.into_inner()).take();
        if let Some((payload, callback)) = taken {
            callback(payload);
        }
    }
}
