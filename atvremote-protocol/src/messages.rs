//! Protocol Messages
//!
//! Fixed byte payloads and the few builders the protocol needs. Every
//! constant here is reproduced bit-for-bit from what Android TV devices
//! expect; they are not general protobuf encodings.

use crate::codec::{frame_control, frame_pairing, FieldWriter};
use crate::Result;

// ---- Control channel (port 6466) ----

/// Reply to an inbound `Configure` request
pub const CONFIGURE_ACK: &[u8] = &[0x05, 0x0a, 0x03, 0x08, 0xee, 0x04];

/// Reply to an inbound `SetActive` request
pub const ACTIVE_ACK: &[u8] = &[0x05, 0x12, 0x03, 0x08, 0xee, 0x04];

/// Field numbers of the control channel envelope
pub mod control_field {
    pub const CONFIGURE: u32 = 1;
    pub const SET_ACTIVE: u32 = 2;
    pub const PING_REQUEST: u32 = 8;
    pub const PING_RESPONSE: u32 = 9;
    pub const KEY_INJECT: u32 = 10;
    pub const APP_LINK_LAUNCH: u32 = 90;
}

/// Key press direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyAction {
    Down = 1,
    Up = 2,
}

/// Build a framed key injection message
pub fn key_inject(key_code: u32, action: KeyAction) -> Result<Vec<u8>> {
    let mut inner = FieldWriter::new();
    inner
        .varint_field(1, key_code)?
        .varint_field(2, action as u32)?;

    let mut body = FieldWriter::new();
    body.message_field(control_field::KEY_INJECT, inner)?;
    frame_control(&body.into_bytes())
}

/// Build a framed ping response echoing the device's ping count
pub fn pong(count: u32) -> Result<Vec<u8>> {
    let mut inner = FieldWriter::new();
    inner.varint_field(1, count)?;

    let mut body = FieldWriter::new();
    body.message_field(control_field::PING_RESPONSE, inner)?;
    frame_control(&body.into_bytes())
}

/// Build a framed app link launch message
///
/// Only the URI is carried. Devices drop the connection when the package
/// name field is present, so it is never encoded.
pub fn app_link_launch(uri: &str) -> Result<Vec<u8>> {
    let mut inner = FieldWriter::new();
    inner.bytes_field(1, uri.as_bytes())?;

    let mut body = FieldWriter::new();
    body.message_field(control_field::APP_LINK_LAUNCH, inner)?;
    frame_control(&body.into_bytes())
}

// ---- Pairing channel (port 6467) ----

/// `protocol_version = 2, status = 200`
pub const PAIRING_HEADER: &[u8] = &[0x08, 0x02, 0x10, 0xc8, 0x01];

/// Service `com.google.android.videos`, client name `RTI`
pub const PAIRING_REQUEST: &[u8] = &[
    0x27, 0x08, 0x02, 0x10, 0xc8, 0x01, 0x52, 0x20, 0x0a, 0x19, 0x63, 0x6f, 0x6d, 0x2e, 0x67,
    0x6f, 0x6f, 0x67, 0x6c, 0x65, 0x2e, 0x61, 0x6e, 0x64, 0x72, 0x6f, 0x69, 0x64, 0x2e, 0x76,
    0x69, 0x64, 0x65, 0x6f, 0x73, 0x12, 0x03, 0x52, 0x54, 0x49,
];

/// Hexadecimal encoding, 6 symbols, input role
pub const OPTIONS_REQUEST: &[u8] = &[
    0x16, 0x08, 0x02, 0x10, 0xc8, 0x01, 0xa2, 0x01, 0x0e, 0x0a, 0x04, 0x08, 0x03, 0x10, 0x06,
    0x12, 0x04, 0x08, 0x03, 0x10, 0x06, 0x18, 0x02,
];

pub const CONFIGURATION_REQUEST: &[u8] = &[
    0x10, 0x08, 0x02, 0x10, 0xc8, 0x01, 0xf2, 0x01, 0x08, 0x0a, 0x04, 0x08, 0x03, 0x10, 0x06,
    0x10, 0x01,
];

/// Field number carrying the pairing secret
const SECRET_FIELD: u32 = 40;

/// Inbound pairing message kinds, identified by the byte after the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMessage {
    PairingRequestAck,
    Options,
    ConfigurationAck,
    SecretAck,
}

impl PairingMessage {
    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            0x5a => Some(PairingMessage::PairingRequestAck),
            0xa2 => Some(PairingMessage::Options),
            0xfa => Some(PairingMessage::ConfigurationAck),
            0xca => Some(PairingMessage::SecretAck),
            _ => None,
        }
    }
}

/// Build the framed `Secret` message carrying the alpha digest
pub fn secret(alpha: &[u8]) -> Result<Vec<u8>> {
    let mut inner = FieldWriter::new();
    inner.bytes_field(1, alpha)?;

    let mut body = FieldWriter::new();
    body.raw(PAIRING_HEADER)
        .message_field(SECRET_FIELD, inner)?;
    frame_pairing(&body.into_bytes())
}

// ---- Certificate sniffing ----

/// TLS 1.2 ClientHello used to make the pairing port send its certificate
pub const CLIENT_HELLO: &[u8] = &[
    0x16, 0x03, 0x01, 0x01, 0x20, 0x01, 0x00, 0x01, 0x1c, 0x03, 0x03, 0xf4, 0xcf, 0x7a, 0x30,
    0x87, 0xf3, 0x4f, 0x7e, 0xaa, 0x94, 0x57, 0x7c, 0xcd, 0x02, 0xe4, 0x02, 0x1a, 0xaa, 0xbb,
    0x78, 0xea, 0x85, 0x7a, 0xbc, 0xa8, 0x5b, 0x08, 0x00, 0x02, 0x1b, 0x92, 0x9a, 0x20, 0x72,
    0x86, 0xb5, 0xd1, 0x91, 0x60, 0x83, 0x36, 0x34, 0x73, 0x4b, 0x5a, 0x41, 0x7c, 0xf8, 0x81,
    0xee, 0x8e, 0xee, 0x34, 0xb1, 0x1f, 0x00, 0xff, 0x0f, 0xca, 0x5d, 0x86, 0x2e, 0x91, 0x15,
    0x93, 0x00, 0x3e, 0x13, 0x02, 0x13, 0x03, 0x13, 0x01, 0xc0, 0x2c, 0xc0, 0x30, 0x00, 0x9f,
    0xcc, 0xa9, 0xcc, 0xa8, 0xcc, 0xaa, 0xc0, 0x2b, 0xc0, 0x2f, 0x00, 0x9e, 0xc0, 0x24, 0xc0,
    0x28, 0x00, 0x6b, 0xc0, 0x23, 0xc0, 0x27, 0x00, 0x67, 0xc0, 0x0a, 0xc0, 0x14, 0x00, 0x39,
    0xc0, 0x09, 0xc0, 0x13, 0x00, 0x33, 0x00, 0x9d, 0x00, 0x9c, 0x00, 0x3d, 0x00, 0x3c, 0x00,
    0x35, 0x00, 0x2f, 0x00, 0xff, 0x01, 0x00, 0x00, 0x95, 0x00, 0x0b, 0x00, 0x04, 0x03, 0x00,
    0x01, 0x02, 0x00, 0x0a, 0x00, 0x0c, 0x00, 0x0a, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x1e, 0x00,
    0x19, 0x00, 0x18, 0x00, 0x23, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x17, 0x00, 0x00,
    0x00, 0x0d, 0x00, 0x30, 0x00, 0x2e, 0x04, 0x03, 0x05, 0x03, 0x06, 0x03, 0x08, 0x07, 0x08,
    0x08, 0x08, 0x09, 0x08, 0x0a, 0x08, 0x0b, 0x08, 0x04, 0x08, 0x05, 0x08, 0x06, 0x04, 0x01,
    0x05, 0x01, 0x06, 0x01, 0x03, 0x03, 0x02, 0x03, 0x03, 0x01, 0x02, 0x01, 0x03, 0x02, 0x02,
    0x02, 0x04, 0x02, 0x05, 0x02, 0x06, 0x02, 0x00, 0x2b, 0x00, 0x09, 0x08, 0x03, 0x04, 0x03,
    0x03, 0x03, 0x02, 0x03, 0x01, 0x00, 0x2d, 0x00, 0x02, 0x01, 0x01, 0x00, 0x33, 0x00, 0x26,
    0x00, 0x24, 0x00, 0x1d, 0x00, 0x20, 0x3f, 0xeb, 0xe3, 0xe5, 0xd7, 0xb0, 0xd5, 0x80, 0xd6,
    0x57, 0x4e, 0x91, 0xf3, 0x3d, 0xc6, 0xf5, 0x95, 0x54, 0xd3, 0xad, 0xab, 0x2e, 0x03, 0x81,
    0xdd, 0xfd, 0xe0, 0xd9, 0xe4, 0x29, 0x18, 0x28,
];
