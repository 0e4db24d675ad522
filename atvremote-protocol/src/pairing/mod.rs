//! Android TV Pairing
//!
//! Pairing produces a shared secret between the driver and a TV so that the
//! TV accepts the driver's certificate on the control port.
//!
//! ## Pairing Flow
//!
//! 1. **Certificate Extraction**: [`CertificateExtractor`] sniffs the TV's
//!    certificate from the pairing port with a canned ClientHello
//! 2. **Handshake**: [`PairingEngine`] opens a TLS connection presenting the
//!    driver's own certificate and exchanges the fixed request messages
//! 3. **Code Entry**: the TV shows a hex code; the user enters it
//! 4. **Proof**: the engine sends SHA256 over both RSA keys and the code's
//!    nonce (see [`compute_alpha`])
//! 5. **Reconnect**: on success the control channel reconnects and the TV
//!    now accepts it
//!
//! ## Timeouts
//!
//! - Certificate extraction: 5 seconds
//! - Pairing connect and TLS handshake: 5 seconds
//! - Waiting for the user's code: none

pub mod certificate;
pub mod engine;
pub mod extractor;
pub mod secret;

pub use certificate::{CertificateInfo, RsaPublicKey};
pub use engine::{PairingEngine, PairingState, PAIRING_TIMEOUT};
pub use extractor::{CertificateExtractor, ExtractorOutcome, TlsRecordReader, CERT_TIMEOUT};
pub use secret::{compute_alpha, PairingAnswer, ALPHA_LEN};
