//! Certificates and RSA key material
//!
//! The driver presents one self-signed certificate on both the pairing and
//! the control port. Its RSA modulus and exponent are the "client" half of
//! the pairing digest; the device certificate sniffed by the extractor is
//! the "server" half.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Organization (O)**: "atvremote"
//! - **Common Name (CN)**: configured client name
//! - **Validity**: 10 years

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate validity period (10 years)
const CERT_VALIDITY_DAYS: u32 = 10 * 365;

/// Organization name in certificate
const CERT_ORG: &str = "atvremote";

/// RSA key size of generated identities
const RSA_BITS: u32 = 2048;

/// RSA public key as big-endian byte strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    modulus: Vec<u8>,
    exponent: Vec<u8>,
}

impl RsaPublicKey {
    pub fn new(modulus: Vec<u8>, exponent: Vec<u8>) -> Self {
        Self { modulus, exponent }
    }

    /// Read the RSA public key out of a DER-encoded X.509 certificate
    pub fn from_der_certificate(der: &[u8]) -> Result<Self> {
        let cert = X509::from_der(der)?;
        let rsa = cert.public_key()?.rsa().map_err(|e| {
            ProtocolError::Crypto(format!("Certificate key is not RSA: {}", e))
        })?;

        Ok(Self {
            modulus: rsa.n().to_vec(),
            exponent: rsa.e().to_vec(),
        })
    }

    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    pub fn exponent(&self) -> &[u8] {
        &self.exponent
    }
}

/// The driver's own certificate and private key
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Common Name of the certificate
    pub common_name: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of the certificate
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed RSA certificate
    ///
    /// ```no_run
    /// use atvremote_protocol::CertificateInfo;
    ///
    /// let identity = CertificateInfo::generate("atvremote").unwrap();
    /// println!("Fingerprint: {}", identity.fingerprint);
    /// ```
    pub fn generate(common_name: impl Into<String>) -> Result<Self> {
        let common_name = common_name.into();

        let rsa = Rsa::generate(RSA_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("CN", &common_name)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.sign(&pkey, MessageDigest::sha256())?;

        let certificate = builder.build().to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated identity certificate {} with fingerprint: {}",
            common_name, fingerprint
        );

        Ok(Self {
            common_name,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// SHA256 fingerprint formatted as XX:XX:...:XX
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let hash = Sha256::digest(cert_der);
        hash.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Client half of the pairing digest
    pub fn public_key(&self) -> Result<RsaPublicKey> {
        RsaPublicKey::from_der_certificate(&self.certificate)
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        fs::write(cert_path, cert.to_pem()?)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );
        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert = X509::from_pem(&fs::read(cert_path)?)?;
        let certificate = cert.to_der()?;

        let pkey = PKey::private_key_from_pem(&fs::read(key_path)?)?;
        let private_key = pkey.private_key_to_der()?;

        let common_name = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .ok_or_else(|| {
                ProtocolError::Crypto("Certificate does not contain Common Name".to_string())
            })?
            .data()
            .as_utf8()?
            .to_string();

        let fingerprint = Self::calculate_fingerprint(&certificate);
        info!(
            "Loaded identity certificate {} with fingerprint: {}",
            common_name, fingerprint
        );

        Ok(Self {
            common_name,
            certificate,
            private_key,
            fingerprint,
        })
    }
}
