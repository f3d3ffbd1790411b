//! Host message codec.
//!
//! Every frame body is a CBOR array `[client_id, type, body]` where `type`
//! is a string tag and `body` a string-keyed map. The daemon on the host
//! side rewrites `client_id` for loopback routing; the runtime echoes what
//! it received.
//!
//! Log records relayed to the host use a separate packed format inside the
//! `log_message` body: repeated `{u8 level, u64 LE timestamp_ns,
//! NUL-terminated UTF-8 message}`, terminated by a zero level byte.

use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

/// Host endpoint value meaning "no particular endpoint".
pub const HOST_ENDPOINT_UNSPECIFIED: u16 = 0xfffe;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("container must be a 3-element array")]
    InvalidContainer,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("log buffer malformed: {0}")]
    MalformedLogBuffer(&'static str),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageContainer {
    pub client_id: u16,
    pub message: HubMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HubMessage {
    NanoappMessage {
        app_id: u64,
        message_type: u32,
        host_endpoint: u16,
        message: Vec<u8>,
    },
    HubInfoRequest,
    HubInfoResponse(HubInfoResponse),
    NanoappListRequest,
    NanoappListResponse {
        apps: Vec<NanoappListEntry>,
    },
    LoadNanoappRequest {
        transaction_id: u32,
        app_id: u64,
        app_version: u32,
        target_api_version: u32,
        app_binary: Vec<u8>,
    },
    LoadNanoappResponse {
        transaction_id: u32,
        success: bool,
    },
    UnloadNanoappRequest {
        transaction_id: u32,
        app_id: u64,
        allow_system_nanoapp_unload: bool,
    },
    UnloadNanoappResponse {
        transaction_id: u32,
        success: bool,
    },
    LogMessage {
        buffer: Vec<u8>,
    },
    TimeSyncRequest,
    /// Host-measured offset (AP minus hub) in nanoseconds.
    TimeSyncMessage {
        offset_ns: i64,
    },
    DebugDumpRequest,
    DebugDumpData {
        data: Vec<u8>,
    },
    DebugDumpResponse {
        success: bool,
        data_count: u32,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HubInfoResponse {
    pub name: String,
    pub vendor: String,
    pub toolchain: String,
    pub platform_version: u32,
    pub toolchain_version: u32,
    pub peak_mips: f32,
    pub stopped_power_mw: f32,
    pub sleep_power_mw: f32,
    pub peak_power_mw: f32,
    pub max_msg_len: u32,
    pub platform_id: u64,
    pub chre_platform_version: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NanoappListEntry {
    pub app_id: u64,
    pub version: u32,
    pub enabled: bool,
    pub is_system: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    NanoappMessage,
    HubInfoRequest,
    HubInfoResponse,
    NanoappListRequest,
    NanoappListResponse,
    LoadNanoappRequest,
    LoadNanoappResponse,
    UnloadNanoappRequest,
    UnloadNanoappResponse,
    LogMessage,
    TimeSyncRequest,
    TimeSyncMessage,
    DebugDumpRequest,
    DebugDumpData,
    DebugDumpResponse,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::NanoappMessage => "nanoapp_message",
            MessageType::HubInfoRequest => "hub_info_request",
            MessageType::HubInfoResponse => "hub_info_response",
            MessageType::NanoappListRequest => "nanoapp_list_request",
            MessageType::NanoappListResponse => "nanoapp_list_response",
            MessageType::LoadNanoappRequest => "load_nanoapp_request",
            MessageType::LoadNanoappResponse => "load_nanoapp_response",
            MessageType::UnloadNanoappRequest => "unload_nanoapp_request",
            MessageType::UnloadNanoappResponse => "unload_nanoapp_response",
            MessageType::LogMessage => "log_message",
            MessageType::TimeSyncRequest => "time_sync_request",
            MessageType::TimeSyncMessage => "time_sync_message",
            MessageType::DebugDumpRequest => "debug_dump_request",
            MessageType::DebugDumpData => "debug_dump_data",
            MessageType::DebugDumpResponse => "debug_dump_response",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "nanoapp_message" => MessageType::NanoappMessage,
            "hub_info_request" => MessageType::HubInfoRequest,
            "hub_info_response" => MessageType::HubInfoResponse,
            "nanoapp_list_request" => MessageType::NanoappListRequest,
            "nanoapp_list_response" => MessageType::NanoappListResponse,
            "load_nanoapp_request" => MessageType::LoadNanoappRequest,
            "load_nanoapp_response" => MessageType::LoadNanoappResponse,
            "unload_nanoapp_request" => MessageType::UnloadNanoappRequest,
            "unload_nanoapp_response" => MessageType::UnloadNanoappResponse,
            "log_message" => MessageType::LogMessage,
            "time_sync_request" => MessageType::TimeSyncRequest,
            "time_sync_message" => MessageType::TimeSyncMessage,
            "debug_dump_request" => MessageType::DebugDumpRequest,
            "debug_dump_data" => MessageType::DebugDumpData,
            "debug_dump_response" => MessageType::DebugDumpResponse,
            _ => return None,
        })
    }
}

fn message_type_of(message: &HubMessage) -> MessageType {
    match message {
        HubMessage::NanoappMessage { .. } => MessageType::NanoappMessage,
        HubMessage::HubInfoRequest => MessageType::HubInfoRequest,
        HubMessage::HubInfoResponse(_) => MessageType::HubInfoResponse,
        HubMessage::NanoappListRequest => MessageType::NanoappListRequest,
        HubMessage::NanoappListResponse { .. } => MessageType::NanoappListResponse,
        HubMessage::LoadNanoappRequest { .. } => MessageType::LoadNanoappRequest,
        HubMessage::LoadNanoappResponse { .. } => MessageType::LoadNanoappResponse,
        HubMessage::UnloadNanoappRequest { .. } => MessageType::UnloadNanoappRequest,
        HubMessage::UnloadNanoappResponse { .. } => MessageType::UnloadNanoappResponse,
        HubMessage::LogMessage { .. } => MessageType::LogMessage,
        HubMessage::TimeSyncRequest => MessageType::TimeSyncRequest,
        HubMessage::TimeSyncMessage { .. } => MessageType::TimeSyncMessage,
        HubMessage::DebugDumpRequest => MessageType::DebugDumpRequest,
        HubMessage::DebugDumpData { .. } => MessageType::DebugDumpData,
        HubMessage::DebugDumpResponse { .. } => MessageType::DebugDumpResponse,
    }
}

pub fn encode_container(container: &MessageContainer) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.array(3)?;
    enc.u16(container.client_id)?;
    enc.str(message_type_of(&container.message).as_str())?;
    encode_body(&mut enc, &container.message)?;
    Ok(buf)
}

pub fn decode_container(bytes: &[u8]) -> Result<MessageContainer, CodecError> {
    let mut dec = Decoder::new(bytes);
    if dec.array()? != Some(3) {
        return Err(CodecError::InvalidContainer);
    }
    let client_id = dec.u16()?;
    let raw_type = dec.str()?;
    let message_type = MessageType::parse(raw_type)
        .ok_or_else(|| CodecError::UnknownMessageType(raw_type.to_string()))?;
    let message = decode_body(&mut dec, message_type)?;
    if dec.datatype().is_ok() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(MessageContainer { client_id, message })
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;

fn encode_body(enc: &mut Enc<'_>, message: &HubMessage) -> Result<(), CodecError> {
    match message {
        HubMessage::NanoappMessage {
            app_id,
            message_type,
            host_endpoint,
            message,
        } => {
            enc.map(4)?;
            enc.str("app_id")?.u64(*app_id)?;
            enc.str("message_type")?.u32(*message_type)?;
            enc.str("host_endpoint")?.u16(*host_endpoint)?;
            enc.str("message")?.bytes(message)?;
        }
        HubMessage::HubInfoRequest
        | HubMessage::NanoappListRequest
        | HubMessage::TimeSyncRequest
        | HubMessage::DebugDumpRequest => {
            enc.map(0)?;
        }
        HubMessage::HubInfoResponse(info) => {
            enc.map(12)?;
            enc.str("name")?.str(&info.name)?;
            enc.str("vendor")?.str(&info.vendor)?;
            enc.str("toolchain")?.str(&info.toolchain)?;
            enc.str("platform_version")?.u32(info.platform_version)?;
            enc.str("toolchain_version")?.u32(info.toolchain_version)?;
            enc.str("peak_mips")?.f32(info.peak_mips)?;
            enc.str("stopped_power_mw")?.f32(info.stopped_power_mw)?;
            enc.str("sleep_power_mw")?.f32(info.sleep_power_mw)?;
            enc.str("peak_power_mw")?.f32(info.peak_power_mw)?;
            enc.str("max_msg_len")?.u32(info.max_msg_len)?;
            enc.str("platform_id")?.u64(info.platform_id)?;
            enc.str("chre_platform_version")?
                .u32(info.chre_platform_version)?;
        }
        HubMessage::NanoappListResponse { apps } => {
            enc.map(1)?;
            enc.str("apps")?;
            enc.array(apps.len() as u64)?;
            for app in apps {
                enc.map(4)?;
                enc.str("app_id")?.u64(app.app_id)?;
                enc.str("version")?.u32(app.version)?;
                enc.str("enabled")?.bool(app.enabled)?;
                enc.str("is_system")?.bool(app.is_system)?;
            }
        }
        HubMessage::LoadNanoappRequest {
            transaction_id,
            app_id,
            app_version,
            target_api_version,
            app_binary,
        } => {
            enc.map(5)?;
            enc.str("transaction_id")?.u32(*transaction_id)?;
            enc.str("app_id")?.u64(*app_id)?;
            enc.str("app_version")?.u32(*app_version)?;
            enc.str("target_api_version")?.u32(*target_api_version)?;
            enc.str("app_binary")?.bytes(app_binary)?;
        }
        HubMessage::LoadNanoappResponse {
            transaction_id,
            success,
        }
        | HubMessage::UnloadNanoappResponse {
            transaction_id,
            success,
        } => {
            enc.map(2)?;
            enc.str("transaction_id")?.u32(*transaction_id)?;
            enc.str("success")?.bool(*success)?;
        }
        HubMessage::UnloadNanoappRequest {
            transaction_id,
            app_id,
            allow_system_nanoapp_unload,
        } => {
            enc.map(3)?;
            enc.str("transaction_id")?.u32(*transaction_id)?;
            enc.str("app_id")?.u64(*app_id)?;
            enc.str("allow_system_nanoapp_unload")?
                .bool(*allow_system_nanoapp_unload)?;
        }
        HubMessage::LogMessage { buffer } => {
            enc.map(1)?;
            enc.str("buffer")?.bytes(buffer)?;
        }
        HubMessage::TimeSyncMessage { offset_ns } => {
            enc.map(1)?;
            enc.str("offset_ns")?.i64(*offset_ns)?;
        }
        HubMessage::DebugDumpData { data } => {
            enc.map(1)?;
            enc.str("data")?.bytes(data)?;
        }
        HubMessage::DebugDumpResponse {
            success,
            data_count,
        } => {
            enc.map(2)?;
            enc.str("success")?.bool(*success)?;
            enc.str("data_count")?.u32(*data_count)?;
        }
    }
    Ok(())
}

/// Decode a string-keyed body map, tolerant of unknown keys and key order.
/// `visit` returns false for keys it does not recognise; their values are
/// skipped.
fn decode_map_fields<'a, T: Default>(
    dec: &mut Decoder<'a>,
    mut visit: impl FnMut(&str, &mut Decoder<'a>, &mut T) -> Result<bool, CodecError>,
) -> Result<T, CodecError> {
    let mut out = T::default();
    let len = dec.map()?.ok_or(CodecError::InvalidContainer)?;
    for _ in 0..len {
        let key = dec.str()?.to_string();
        if !visit(&key, dec, &mut out)? {
            dec.skip()?;
        }
    }
    Ok(out)
}

fn decode_body(dec: &mut Decoder<'_>, message_type: MessageType) -> Result<HubMessage, CodecError> {
    match message_type {
        MessageType::NanoappMessage => {
            #[derive(Default)]
            struct Raw {
                app_id: Option<u64>,
                message_type: Option<u32>,
                host_endpoint: Option<u16>,
                message: Option<Vec<u8>>,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "app_id" => out.app_id = Some(dec.u64()?),
                    "message_type" => out.message_type = Some(dec.u32()?),
                    "host_endpoint" => out.host_endpoint = Some(dec.u16()?),
                    "message" => out.message = Some(dec.bytes()?.to_vec()),
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::NanoappMessage {
                app_id: raw.app_id.ok_or(CodecError::MissingField("app_id"))?,
                message_type: raw
                    .message_type
                    .ok_or(CodecError::MissingField("message_type"))?,
                host_endpoint: raw.host_endpoint.unwrap_or(HOST_ENDPOINT_UNSPECIFIED),
                message: raw.message.ok_or(CodecError::MissingField("message"))?,
            })
        }
        MessageType::HubInfoRequest => {
            skip_body(dec)?;
            Ok(HubMessage::HubInfoRequest)
        }
        MessageType::NanoappListRequest => {
            skip_body(dec)?;
            Ok(HubMessage::NanoappListRequest)
        }
        MessageType::TimeSyncRequest => {
            skip_body(dec)?;
            Ok(HubMessage::TimeSyncRequest)
        }
        MessageType::DebugDumpRequest => {
            skip_body(dec)?;
            Ok(HubMessage::DebugDumpRequest)
        }
        MessageType::HubInfoResponse => {
            let info = decode_map_fields::<HubInfoResponse>(dec, |key, dec, out| {
                match key {
                    "name" => out.name = dec.str()?.to_string(),
                    "vendor" => out.vendor = dec.str()?.to_string(),
                    "toolchain" => out.toolchain = dec.str()?.to_string(),
                    "platform_version" => out.platform_version = dec.u32()?,
                    "toolchain_version" => out.toolchain_version = dec.u32()?,
                    "peak_mips" => out.peak_mips = dec.f32()?,
                    "stopped_power_mw" => out.stopped_power_mw = dec.f32()?,
                    "sleep_power_mw" => out.sleep_power_mw = dec.f32()?,
                    "peak_power_mw" => out.peak_power_mw = dec.f32()?,
                    "max_msg_len" => out.max_msg_len = dec.u32()?,
                    "platform_id" => out.platform_id = dec.u64()?,
                    "chre_platform_version" => out.chre_platform_version = dec.u32()?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::HubInfoResponse(info))
        }
        MessageType::NanoappListResponse => {
            #[derive(Default)]
            struct Raw {
                apps: Vec<NanoappListEntry>,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "apps" => {
                        let len = dec.array()?.ok_or(CodecError::InvalidContainer)?;
                        for _ in 0..len {
                            out.apps.push(decode_list_entry(dec)?);
                        }
                    }
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::NanoappListResponse { apps: raw.apps })
        }
        MessageType::LoadNanoappRequest => {
            #[derive(Default)]
            struct Raw {
                transaction_id: Option<u32>,
                app_id: Option<u64>,
                app_version: u32,
                target_api_version: u32,
                app_binary: Vec<u8>,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "transaction_id" => out.transaction_id = Some(dec.u32()?),
                    "app_id" => out.app_id = Some(dec.u64()?),
                    "app_version" => out.app_version = dec.u32()?,
                    "target_api_version" => out.target_api_version = dec.u32()?,
                    "app_binary" => out.app_binary = dec.bytes()?.to_vec(),
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::LoadNanoappRequest {
                transaction_id: raw
                    .transaction_id
                    .ok_or(CodecError::MissingField("transaction_id"))?,
                app_id: raw.app_id.ok_or(CodecError::MissingField("app_id"))?,
                app_version: raw.app_version,
                target_api_version: raw.target_api_version,
                app_binary: raw.app_binary,
            })
        }
        MessageType::LoadNanoappResponse | MessageType::UnloadNanoappResponse => {
            #[derive(Default)]
            struct Raw {
                transaction_id: Option<u32>,
                success: bool,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "transaction_id" => out.transaction_id = Some(dec.u32()?),
                    "success" => out.success = dec.bool()?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            let transaction_id = raw
                .transaction_id
                .ok_or(CodecError::MissingField("transaction_id"))?;
            Ok(if message_type == MessageType::LoadNanoappResponse {
                HubMessage::LoadNanoappResponse {
                    transaction_id,
                    success: raw.success,
                }
            } else {
                HubMessage::UnloadNanoappResponse {
                    transaction_id,
                    success: raw.success,
                }
            })
        }
        MessageType::UnloadNanoappRequest => {
            #[derive(Default)]
            struct Raw {
                transaction_id: Option<u32>,
                app_id: Option<u64>,
                allow_system_nanoapp_unload: bool,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "transaction_id" => out.transaction_id = Some(dec.u32()?),
                    "app_id" => out.app_id = Some(dec.u64()?),
                    "allow_system_nanoapp_unload" => {
                        out.allow_system_nanoapp_unload = dec.bool()?
                    }
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::UnloadNanoappRequest {
                transaction_id: raw
                    .transaction_id
                    .ok_or(CodecError::MissingField("transaction_id"))?,
                app_id: raw.app_id.ok_or(CodecError::MissingField("app_id"))?,
                allow_system_nanoapp_unload: raw.allow_system_nanoapp_unload,
            })
        }
        MessageType::LogMessage => {
            #[derive(Default)]
            struct Raw {
                buffer: Vec<u8>,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "buffer" => out.buffer = dec.bytes()?.to_vec(),
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::LogMessage { buffer: raw.buffer })
        }
        MessageType::TimeSyncMessage => {
            #[derive(Default)]
            struct Raw {
                offset_ns: i64,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "offset_ns" => out.offset_ns = dec.i64()?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::TimeSyncMessage {
                offset_ns: raw.offset_ns,
            })
        }
        MessageType::DebugDumpData => {
            #[derive(Default)]
            struct Raw {
                data: Vec<u8>,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "data" => out.data = dec.bytes()?.to_vec(),
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::DebugDumpData { data: raw.data })
        }
        MessageType::DebugDumpResponse => {
            #[derive(Default)]
            struct Raw {
                success: bool,
                data_count: u32,
            }
            let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
                match key {
                    "success" => out.success = dec.bool()?,
                    "data_count" => out.data_count = dec.u32()?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            Ok(HubMessage::DebugDumpResponse {
                success: raw.success,
                data_count: raw.data_count,
            })
        }
    }
}

fn decode_list_entry(dec: &mut Decoder<'_>) -> Result<NanoappListEntry, CodecError> {
    #[derive(Default)]
    struct Raw {
        app_id: Option<u64>,
        version: u32,
        enabled: bool,
        is_system: bool,
    }
    let raw = decode_map_fields::<Raw>(dec, |key, dec, out| {
        match key {
            "app_id" => out.app_id = Some(dec.u64()?),
            "version" => out.version = dec.u32()?,
            "enabled" => out.enabled = dec.bool()?,
            "is_system" => out.is_system = dec.bool()?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(NanoappListEntry {
        app_id: raw.app_id.ok_or(CodecError::MissingField("app_id"))?,
        version: raw.version,
        enabled: raw.enabled,
        is_system: raw.is_system,
    })
}

fn skip_body(dec: &mut Decoder<'_>) -> Result<(), CodecError> {
    dec.skip()?;
    Ok(())
}

// === Packed log relay format ======================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp_ns: u64,
    pub message: String,
}

/// Pack log entries into the relay wire format. Interior NULs in messages
/// are dropped (they would truncate the entry on the reader side).
pub fn pack_log_entries(entries: &[LogEntry]) -> Vec<u8> {
    let mut buffer = Vec::new();
    for entry in entries {
        buffer.push(entry.level.as_u8());
        buffer.extend_from_slice(&entry.timestamp_ns.to_le_bytes());
        buffer.extend(entry.message.bytes().filter(|&b| b != 0));
        buffer.push(0);
    }
    buffer.push(0);
    buffer
}

/// Parse a packed log buffer; stops at the terminating zero level byte.
pub fn parse_log_buffer(mut buffer: &[u8]) -> Result<Vec<LogEntry>, CodecError> {
    let mut entries = Vec::new();
    loop {
        let Some((&level_byte, rest)) = buffer.split_first() else {
            return Err(CodecError::MalformedLogBuffer("missing terminator"));
        };
        if level_byte == 0 {
            return Ok(entries);
        }
        let level = LogLevel::from_u8(level_byte)
            .ok_or(CodecError::MalformedLogBuffer("bad level byte"))?;
        if rest.len() < 8 {
            return Err(CodecError::MalformedLogBuffer("truncated timestamp"));
        }
        let (ts, rest) = rest.split_at(8);
        let timestamp_ns = u64::from_le_bytes(ts.try_into().expect("8-byte slice"));
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::MalformedLogBuffer("unterminated message"))?;
        let message = std::str::from_utf8(&rest[..nul])
            .map_err(|_| CodecError::MalformedLogBuffer("message is not UTF-8"))?
            .to_string();
        entries.push(LogEntry {
            level,
            timestamp_ns,
            message,
        });
        buffer = &rest[nul + 1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: HubMessage) {
        let container = MessageContainer {
            client_id: 7,
            message,
        };
        let bytes = encode_container(&container).unwrap();
        assert_eq!(decode_container(&bytes).unwrap(), container);
    }

    #[test]
    fn nanoapp_message_roundtrips() {
        roundtrip(HubMessage::NanoappMessage {
            app_id: 0x0123_4567_89ab_cdef,
            message_type: 42,
            host_endpoint: HOST_ENDPOINT_UNSPECIFIED,
            message: vec![1, 2, 3],
        });
    }

    #[test]
    fn hub_info_exchange_roundtrips() {
        roundtrip(HubMessage::HubInfoRequest);
        roundtrip(HubMessage::HubInfoResponse(HubInfoResponse {
            name: "hub".into(),
            vendor: "acme".into(),
            toolchain: "rustc".into(),
            platform_version: 3,
            toolchain_version: 1,
            peak_mips: 350.0,
            stopped_power_mw: 0.1,
            sleep_power_mw: 1.5,
            peak_power_mw: 150.0,
            max_msg_len: 2048,
            platform_id: 0x10,
            chre_platform_version: 0x0100_0000,
        }));
    }

    #[test]
    fn lifecycle_messages_roundtrip() {
        roundtrip(HubMessage::NanoappListResponse {
            apps: vec![NanoappListEntry {
                app_id: 0xA,
                version: 2,
                enabled: true,
                is_system: false,
            }],
        });
        roundtrip(HubMessage::UnloadNanoappRequest {
            transaction_id: 9,
            app_id: 0xA,
            allow_system_nanoapp_unload: false,
        });
        roundtrip(HubMessage::UnloadNanoappResponse {
            transaction_id: 9,
            success: true,
        });
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.array(3).unwrap();
        enc.u16(0).unwrap();
        enc.str("bogus").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_container(&buf),
            Err(CodecError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.array(3).unwrap();
        enc.u16(0).unwrap();
        enc.str("nanoapp_message").unwrap();
        enc.map(1).unwrap();
        enc.str("app_id").unwrap();
        enc.u64(5).unwrap();
        assert!(matches!(
            decode_container(&buf),
            Err(CodecError::MissingField("message"))
        ));
    }

    #[test]
    fn log_buffer_roundtrips() {
        let entries = vec![
            LogEntry {
                level: LogLevel::Error,
                timestamp_ns: 12345,
                message: "allocation failed".into(),
            },
            LogEntry {
                level: LogLevel::Debug,
                timestamp_ns: 67890,
                message: "tick".into(),
            },
        ];
        let packed = pack_log_entries(&entries);
        assert_eq!(parse_log_buffer(&packed).unwrap(), entries);
    }

    #[test]
    fn empty_log_buffer_is_just_a_terminator() {
        let packed = pack_log_entries(&[]);
        assert_eq!(packed, vec![0]);
        assert!(parse_log_buffer(&packed).unwrap().is_empty());
    }

    #[test]
    fn malformed_log_buffer_is_rejected() {
        assert!(parse_log_buffer(&[]).is_err());
        assert!(parse_log_buffer(&[1, 0, 0]).is_err());
        assert!(parse_log_buffer(&[9, 0, 0, 0, 0, 0, 0, 0, 0, b'x', 0, 0]).is_err());
    }
}
