//! Error handling for the Android TV Remote protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are automatically converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! Connect refused, timeouts and disconnects. These are never fatal: the
//! control channel retries them through its reconnect scheduler.
//! See [`ProtocolError::is_recoverable`].
//!
//! ### Protocol Errors
//! Unexpected discriminators, bad fixed headers and malformed TLS records.
//! The affected sub-connection moves to `Failed`; other devices keep running.
//!
//! ### Crypto Errors
//! Certificate parse failures. These abort the current pairing attempt only.
//! Automatically converted from `openssl::error::ErrorStack`.
//!
//! ### Encoding Limit Errors
//! Values the wire codec refuses to encode. The enclosing message is
//! unsendable and must be logged rather than transmitted truncated.
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::warn;
//!
//! if let Err(e) = registry.send_key(&mut host, 1, 19) {
//!     warn!("Failed to send key to device 1: {}", e);
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations
///
/// # Examples
///
/// ```rust
/// use atvremote_protocol::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Automatic Conversions
///
/// - `std::io::Error` → `ProtocolError::Io`
/// - `serde_json::Error` → `ProtocolError::Json`
/// - `base64::DecodeError` → `ProtocolError::Base64`
/// - `openssl::error::ErrorStack` → `ProtocolError::Certificate`
///
/// # Examples
///
/// ```rust
/// use atvremote_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound(7);
/// assert_eq!(error.to_string(), "Device not found: 7");
///
/// let error = ProtocolError::EncodingLimit(1 << 28);
/// assert_eq!(error.to_string(), "Value 268435456 exceeds varint encoding limit");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Raised by the media bridge and the configuration endpoint.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding error (media bridge frames and album art)
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Certificate parsing, generation or persistence error
    ///
    /// Automatically converted from `openssl::error::ErrorStack`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use atvremote_protocol::{RsaPublicKey, Result};
    ///
    /// fn parse(der: &[u8]) -> Result<RsaPublicKey> {
    ///     // OpenSSL errors automatically convert to ProtocolError::Certificate
    ///     RsaPublicKey::from_der_certificate(der)
    /// }
    /// ```
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Key material is unusable for the pairing digest
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Transport failure reported by the host
    #[error("Transport error: {0}")]
    Transport(String),

    /// A connect, handshake or pairing step did not complete in time
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Operation requires an established channel
    ///
    /// # Examples
    ///
    /// ```rust
    /// use atvremote_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::NotConnected("control channel".to_string());
    /// assert_eq!(error.to_string(), "Not connected: control channel");
    /// ```
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Invalid or malformed protocol message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Malformed TLS record while sniffing a certificate
    #[error("Invalid TLS record: {0}")]
    InvalidTlsRecord(String),

    /// Operation not valid in the current state machine state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Value too large for the varint encoder (limit is 2^28 - 1)
    #[error("Value {0} exceeds varint encoding limit")]
    EncodingLimit(u64),

    /// Frame length cannot be represented by the framing convention
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Device index not present in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(usize),

    /// User supplied pairing answer is malformed
    #[error("Invalid pairing answer: {0}")]
    InvalidAnswer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Whether the error belongs to the transport class
    ///
    /// Transport errors are retried by the reconnect scheduler and never
    /// surfaced as fatal.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use atvremote_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Timeout("connect".to_string()).is_recoverable());
    /// assert!(!ProtocolError::InvalidMessage("bad header".to_string()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Transport(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::NotConnected(_)
        )
    }

    /// Whether the user has to act (re-enter a PIN, fix the config) to recover
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidAnswer(_)
                | ProtocolError::DeviceNotFound(_)
                | ProtocolError::Configuration(_)
        )
    }

    /// Whether the error aborts a pairing attempt
    pub fn is_crypto(&self) -> bool {
        matches!(self, ProtocolError::Certificate(_) | ProtocolError::Crypto(_))
    }
}
