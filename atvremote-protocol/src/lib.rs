//! Android TV Remote Protocol Implementation
//!
//! This library implements the Android TV remote protocol (v2) used to pair
//! with and control Android TV devices on the local network: certificate
//! extraction, the pairing handshake, the long-lived control channel with
//! its keepalive, and a registry that routes host events to devices.
//!
//! The crate is sans-IO. State machines issue socket and timer requests
//! through the [`Host`] trait and consume [`IoEvent`]s; an embedding runtime
//! performs the actual networking.

pub mod codec;
pub mod companion;
pub mod configuration;
pub mod connection;
pub mod device;
pub mod handles;
pub mod host;
pub mod media;
pub mod messages;
pub mod pairing;
pub mod registry;

mod error;
#[cfg(test)]
mod test_support;

pub use configuration::{ConfigurationRequest, DeviceStateSnapshot};
pub use connection::{ControlChannel, ControlState};
pub use device::{Device, DeviceConfig};
pub use error::{ProtocolError, Result};
pub use host::{Handle, HandleKind, Host, IoEvent, SocketMode};
pub use pairing::{CertificateInfo, PairingEngine, PairingState, RsaPublicKey};
pub use registry::{DeviceEvent, DeviceRegistry, NowPlaying, RegistryConfig};

/// Default TLS control port
pub const CONTROL_PORT: u16 = 6466;

/// Default TLS pairing port
pub const PAIRING_PORT: u16 = 6467;
