//! Protocol constants and message layout for the NIHIA request channel
//!
//! Every message starts with a 4-byte little-endian message id. Fixed fields
//! are little-endian `u32`s; strings are length-prefixed (the length counts the
//! terminating NUL) and NUL-terminated ASCII.
//!
//! ```text
//! handshake   [msg_id][device_type][software_id][header][serial_len+1][serial..][00]
//! reply       [success][req_len][req_name..][notif_len][notif_name..]
//! ack port    [msg_id][success][padding][name_len+1][name..][00]
//! ```

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ProtocolError;
use crate::types::{DeviceTypeId, KeyZone, SoftwareIdentity};

/// Well-known name of the daemon's bootstrap channel
pub const BOOTSTRAP_PORT_NAME: &str = "NIHWMainHandler";

/// `"true"` read as a little-endian integer; the daemon's success code
pub const SUCCESS: u32 = u32::from_le_bytes(*b"true");

/// Protocol revision sent in the handshake header field
pub const HANDSHAKE_HEADER: u32 = 0x0000_0001;

/// Request message ids (client → daemon)
pub mod msg {
    /// Type-scoped handshake (no serial)
    pub const HANDSHAKE: u32 = 0x0344_7500;
    /// Device-scoped handshake ("connect") carrying a serial
    pub const CONNECT: u32 = 0x0343_6E00;
    /// Tell the daemon where to deliver notifications
    pub const ACKNOWLEDGE_PORT: u32 = 0x0341_6300;
    /// Ask for a fresh batch of attach notifications
    pub const REQUEST_DEVICE_STATE: u32 = 0x0352_7300;
    /// Claim exclusive control of the non-MIDI controls
    pub const ACQUIRE_CONTROL: u32 = 0x0341_7100;
    pub const REQUEST_FOCUS: u32 = 0x0346_6300;
    pub const SET_LED_COLORS: u32 = 0x0349_4C00;
    pub const CONFIGURE_KEYZONES: u32 = 0x0349_4B00;
    pub const DISPLAY_DATA: u32 = 0x0344_4400;

    /// Get human-readable name for a request id
    pub fn name(id: u32) -> &'static str {
        match id {
            HANDSHAKE => "HANDSHAKE",
            CONNECT => "CONNECT",
            ACKNOWLEDGE_PORT => "ACKNOWLEDGE_PORT",
            REQUEST_DEVICE_STATE => "REQUEST_DEVICE_STATE",
            ACQUIRE_CONTROL => "ACQUIRE_CONTROL",
            REQUEST_FOCUS => "REQUEST_FOCUS",
            SET_LED_COLORS => "SET_LED_COLORS",
            CONFIGURE_KEYZONES => "CONFIGURE_KEYZONES",
            DISPLAY_DATA => "DISPLAY_DATA",
            _ => "UNKNOWN",
        }
    }
}

/// Transport timing constants
pub mod timing {
    /// How long `exchange` waits for a reply (ms)
    pub const REPLY_TIMEOUT_MS: u64 = 1000;
    /// Length of one notification poll slice (ms)
    pub const POLL_TIMEOUT_MS: u64 = 1000;
    /// Attempts made while the daemon's pipe reports busy
    pub const PIPE_BUSY_RETRIES: u32 = 10;
    /// Pause between busy-pipe attempts (ms)
    pub const PIPE_BUSY_BACKOFF_MS: u64 = 50;
    /// Consecutive poll timeouts before the channel is considered stalled
    pub const STALL_TIMEOUT_THRESHOLD: u32 = 2;
}

/// Display packet layout
pub mod display {
    /// One physical screen
    pub const SCREEN_WIDTH: usize = 480;
    pub const SCREEN_HEIGHT: usize = 272;
    /// Logical bitmap covering both screens side by side
    pub const FRAME_WIDTH: usize = SCREEN_WIDTH * 2;
    pub const FRAME_HEIGHT: usize = SCREEN_HEIGHT;

    pub const LEFT_DISPLAY_ID: u8 = 0;
    pub const RIGHT_DISPLAY_ID: u8 = 1;

    /// IPC prefix + 16-byte screen preamble + 4-byte transmit command
    pub const HEADER_LEN: usize = 8 + 16 + 4;
    /// 16-bit pixels for one screen
    pub const PAYLOAD_LEN: usize = SCREEN_WIDTH * SCREEN_HEIGHT * 2;
    pub const FOOTER: [u8; 8] = [0x03, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00];
    pub const PACKET_LEN: usize = HEADER_LEN + PAYLOAD_LEN + FOOTER.len();

    /// Build the fixed header for one screen.
    ///
    /// The transmit command's length field counts pixel pairs.
    pub fn header(display_id: u8) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0..4].copy_from_slice(&super::msg::DISPLAY_DATA.to_le_bytes());
        h[4..8].copy_from_slice(&(display_id as u32).to_le_bytes());

        let p = &mut h[8..24];
        p[0] = 0x84;
        p[1] = 0x00;
        p[2] = display_id;
        p[3] = 0x60;
        // p[4..8] reserved, p[8..12] x/y origin = 0
        p[12..14].copy_from_slice(&(SCREEN_WIDTH as u16).to_be_bytes());
        p[14..16].copy_from_slice(&(SCREEN_HEIGHT as u16).to_be_bytes());

        let pairs = (SCREEN_WIDTH * SCREEN_HEIGHT / 2) as u16;
        h[26..28].copy_from_slice(&pairs.to_be_bytes());
        h
    }
}

/// Fixed part of a handshake request, before the serial string
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HandshakeHeader {
    msg_id: U32,
    device_type: U32,
    software_id: U32,
    header: U32,
    serial_len: U32,
}

/// Byte length of [`HandshakeHeader`]
pub const HANDSHAKE_LENGTH: usize = std::mem::size_of::<HandshakeHeader>();

/// Fixed part of an acknowledge-notification-port request
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AckPortHeader {
    msg_id: U32,
    success: U32,
    padding: U32,
    name_len: U32,
}

/// Body-less request: id plus two reserved words
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SimpleRequest {
    msg_id: U32,
    reserved0: U32,
    reserved1: U32,
}

/// Decoded handshake request (used by fakes and capture tooling)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub msg_id: u32,
    pub device_type: DeviceTypeId,
    pub software: SoftwareIdentity,
    pub serial: String,
}

/// Channel names handed out by a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub request_channel: String,
    pub notification_channel: String,
}

/// Encode a handshake request.
///
/// An empty serial produces the type-scoped `HANDSHAKE`, anything else the
/// device-scoped `CONNECT`. Length is `HANDSHAKE_LENGTH + serial.len() + 1`.
pub fn encode_handshake(
    device_type: DeviceTypeId,
    software: SoftwareIdentity,
    serial: &str,
) -> Vec<u8> {
    let msg_id = if serial.is_empty() {
        msg::HANDSHAKE
    } else {
        msg::CONNECT
    };
    let header = HandshakeHeader {
        msg_id: U32::new(msg_id),
        device_type: U32::new(device_type.0),
        software_id: U32::new(software.0),
        header: U32::new(HANDSHAKE_HEADER),
        serial_len: U32::new(serial.len() as u32 + 1),
    };

    let mut buf = Vec::with_capacity(HANDSHAKE_LENGTH + serial.len() + 1);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(serial.as_bytes());
    buf.push(0);
    buf
}

/// Decode a handshake request
pub fn decode_handshake(data: &[u8]) -> Result<HandshakeRequest, ProtocolError> {
    let (header, rest) =
        HandshakeHeader::read_from_prefix(data).map_err(|_| ProtocolError::Truncated {
            needed: HANDSHAKE_LENGTH,
            got: data.len(),
        })?;
    let serial = take_string(rest, header.serial_len.get() as usize)?;
    Ok(HandshakeRequest {
        msg_id: header.msg_id.get(),
        device_type: DeviceTypeId(header.device_type.get()),
        software: SoftwareIdentity(header.software_id.get()),
        serial,
    })
}

/// Parse the daemon's handshake reply.
///
/// A reply of exactly four bytes is a protocol-level error, whatever its value.
pub fn parse_handshake_reply(data: &[u8]) -> Result<HandshakeReply, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyReply);
    }
    let mut r = WireReader::new(data);
    let code = r.u32()?;
    if data.len() == 4 {
        return Err(ProtocolError::ErrorReply(code));
    }
    if code != SUCCESS {
        return Err(ProtocolError::SuccessMismatch { got: code });
    }
    let request_channel = r.string()?;
    let notification_channel = r.string()?;
    if request_channel.is_empty() || notification_channel.is_empty() {
        return Err(ProtocolError::InvalidName);
    }
    Ok(HandshakeReply {
        request_channel,
        notification_channel,
    })
}

/// Encode a successful handshake reply (fakes and tooling)
pub fn encode_handshake_reply(reply: &HandshakeReply) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        12 + reply.request_channel.len() + reply.notification_channel.len() + 2,
    );
    put_u32(&mut buf, SUCCESS);
    put_string(&mut buf, &reply.request_channel);
    put_string(&mut buf, &reply.notification_channel);
    buf
}

/// Encode the acknowledge-notification-port request
pub fn encode_ack_port(port_name: &str) -> Vec<u8> {
    let header = AckPortHeader {
        msg_id: U32::new(msg::ACKNOWLEDGE_PORT),
        success: U32::new(SUCCESS),
        padding: U32::new(0),
        name_len: U32::new(port_name.len() as u32 + 1),
    };
    let mut buf = Vec::with_capacity(std::mem::size_of::<AckPortHeader>() + port_name.len() + 1);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(port_name.as_bytes());
    buf.push(0);
    buf
}

/// Decode an acknowledge-notification-port request, returning the port name
pub fn decode_ack_port(data: &[u8]) -> Result<String, ProtocolError> {
    let (header, rest) =
        AckPortHeader::read_from_prefix(data).map_err(|_| ProtocolError::Truncated {
            needed: std::mem::size_of::<AckPortHeader>(),
            got: data.len(),
        })?;
    take_string(rest, header.name_len.get() as usize)
}

/// Check that a reply starts with the success code
pub fn check_success_reply(data: &[u8]) -> Result<(), ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyReply);
    }
    let code = WireReader::new(data).u32()?;
    if code != SUCCESS {
        return Err(ProtocolError::SuccessMismatch { got: code });
    }
    Ok(())
}

/// Encode a body-less request such as `ACQUIRE_CONTROL`
pub fn encode_simple(msg_id: u32) -> Vec<u8> {
    SimpleRequest {
        msg_id: U32::new(msg_id),
        reserved0: U32::new(0),
        reserved1: U32::new(0),
    }
    .as_bytes()
    .to_vec()
}

/// Encode per-key LED colors (one palette index per key)
pub fn encode_led_colors(colors: &[u8]) -> Vec<u8> {
    let padded = colors.len().div_ceil(4) * 4;
    let mut buf = Vec::with_capacity(12 + padded);
    put_u32(&mut buf, msg::SET_LED_COLORS);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, colors.len() as u32);
    buf.extend_from_slice(colors);
    buf.resize(12 + padded, 0);
    buf
}

/// Encode key-zone configuration
pub fn encode_keyzones(zones: &[KeyZone]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + zones.len() * 12);
    put_u32(&mut buf, msg::CONFIGURE_KEYZONES);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, zones.len() as u32);
    for zone in zones {
        put_u32(&mut buf, zone.first_key);
        put_u32(&mut buf, zone.last_key);
        put_u32(&mut buf, zone.color);
    }
    buf
}

/// Read the leading message id, if present
pub fn message_id(data: &[u8]) -> Option<u32> {
    data.get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a length-prefixed, NUL-terminated string
pub(crate) fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32 + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Take `len` bytes as a string, dropping trailing NULs
fn take_string(data: &[u8], len: usize) -> Result<String, ProtocolError> {
    let bytes = data.get(..len).ok_or(ProtocolError::Truncated {
        needed: len,
        got: data.len(),
    })?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Cursor over a little-endian message body
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(ProtocolError::Truncated {
                needed: self.pos + 4,
                got: self.data.len(),
            })?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.u32().map(|v| v as i32)
    }

    /// Length-prefixed string; the length may or may not include the NUL
    pub(crate) fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let s = take_string(&self.data[self.pos..], len)?;
        self.pos += len;
        Ok(s)
    }
}
