//! Pairing secret derivation
//!
//! The TV shows a short hex code. Its first half is a check value and its
//! second half is a nonce. The proof sent back to the TV is
//!
//! ```text
//! alpha = SHA256(client_modulus || client_exponent
//!             || server_modulus || server_exponent || nonce)
//! ```
//!
//! where every key component has its leading zero bytes removed first.
//! The order of the inputs matters and must not be changed.

use super::certificate::RsaPublicKey;
use crate::{ProtocolError, Result};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Length of the alpha digest
pub const ALPHA_LEN: usize = 32;

/// A parsed user-entered pairing code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAnswer {
    check: Vec<u8>,
    nonce: Vec<u8>,
}

impl PairingAnswer {
    /// Parse the code shown on the TV
    ///
    /// The code must be an even number of hex characters. Codes other than
    /// 4 or 6 characters are accepted with a warning.
    ///
    /// ```
    /// use atvremote_protocol::pairing::PairingAnswer;
    ///
    /// let answer = PairingAnswer::parse("A1B2C3").unwrap();
    /// assert_eq!(answer.nonce(), &[0xb2, 0xc3]);
    /// ```
    pub fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ProtocolError::InvalidAnswer("empty code".to_string()));
        }

        let bytes = hex::decode(code)
            .map_err(|e| ProtocolError::InvalidAnswer(format!("{:?}: {}", code, e)))?;

        if code.len() != 4 && code.len() != 6 {
            warn!("Unusual pairing code length {} (expected 4 or 6)", code.len());
        }

        let split = bytes.len() / 2;
        Ok(Self {
            check: bytes[..split].to_vec(),
            nonce: bytes[split..].to_vec(),
        })
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// First byte of the check half, compared against `alpha[0]`
    pub fn check_byte(&self) -> Option<u8> {
        self.check.first().copied()
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Compute the pairing proof
///
/// `client` is the driver's own key, `server` the key extracted from the
/// device certificate.
pub fn compute_alpha(client: &RsaPublicKey, server: &RsaPublicKey, nonce: &[u8]) -> [u8; ALPHA_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(strip_leading_zeros(client.modulus()));
    hasher.update(strip_leading_zeros(client.exponent()));
    hasher.update(strip_leading_zeros(server.modulus()));
    hasher.update(strip_leading_zeros(server.exponent()));
    hasher.update(nonce);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RsaPublicKey {
        RsaPublicKey::new(vec![0x00, 0xc1, 0xad, 0x95, 0xb0], vec![0x01, 0x00, 0x01])
    }

    fn server() -> RsaPublicKey {
        RsaPublicKey::new(vec![0x00, 0x00, 0xe5, 0x82, 0x2b], vec![0x01, 0x00, 0x01])
    }

    #[test]
    fn test_alpha_known_digest() {
        let answer = PairingAnswer::parse("A1B2C3").unwrap();
        let alpha = compute_alpha(&client(), &server(), answer.nonce());
        assert_eq!(
            hex::encode(alpha),
            "5a0c2523584aac79e3e372597ab6ae36f1a6b421118881249ff1fff434647da9"
        );
    }

    #[test]
    fn test_alpha_is_order_sensitive() {
        let nonce = [0xb2, 0xc3];
        let forward = compute_alpha(&client(), &server(), &nonce);
        let swapped = compute_alpha(&server(), &client(), &nonce);
        assert_ne!(forward, swapped);
        assert_eq!(
            hex::encode(swapped),
            "1b72999d6b878e8cb45a9215d54594eb3598b1d34d6aaa27cc95f972075a5035"
        );
    }

    #[test]
    fn test_leading_zero_bytes_do_not_change_alpha() {
        let padded = RsaPublicKey::new(
            vec![0x00, 0x00, 0x00, 0xc1, 0xad, 0x95, 0xb0],
            vec![0x00, 0x01, 0x00, 0x01],
        );
        let nonce = [0xb2, 0xc3];
        assert_eq!(
            compute_alpha(&padded, &server(), &nonce),
            compute_alpha(&client(), &server(), &nonce)
        );
    }

    #[test]
    fn test_strip_keeps_ascii_zero() {
        // 0x30 is not a zero byte
        assert_eq!(strip_leading_zeros(&[0x30, 0x01]), &[0x30, 0x01]);
        assert_eq!(strip_leading_zeros(&[0x00, 0x00]), &[] as &[u8]);
    }

    #[test]
    fn test_answer_split() {
        let answer = PairingAnswer::parse("9c3e").unwrap();
        assert_eq!(answer.check_byte(), Some(0x9c));
        assert_eq!(answer.nonce(), &[0x3e]);

        // integer division puts the extra byte in the nonce
        let answer = PairingAnswer::parse("7D4F21").unwrap();
        assert_eq!(answer.check_byte(), Some(0x7d));
        assert_eq!(answer.nonce(), &[0x4f, 0x21]);
    }

    #[test]
    fn test_invalid_answers() {
        assert!(matches!(
            PairingAnswer::parse("ABC"),
            Err(ProtocolError::InvalidAnswer(_))
        ));
        assert!(matches!(
            PairingAnswer::parse("ZZ12"),
            Err(ProtocolError::InvalidAnswer(_))
        ));
        assert!(PairingAnswer::parse("").is_err());
    }

    #[test]
    fn test_unusual_length_accepted() {
        let answer = PairingAnswer::parse("0102030405060708").unwrap();
        assert_eq!(answer.nonce(), &[0x05, 0x06, 0x07, 0x08]);
    }
}
