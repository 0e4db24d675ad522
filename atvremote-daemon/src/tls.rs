//! TLS client configuration
//!
//! Both TV ports speak TLS with self-signed certificates. The driver presents
//! its own identity as the client certificate; the TV's certificate is not
//! verified because pairing itself authenticates the key.

use anyhow::{Context, Result};
use atvremote_protocol::CertificateInfo;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

/// Create the connector used for every TLS socket
pub fn create_connector(identity: &CertificateInfo) -> Result<Arc<SslConnector>> {
    debug!("Creating TLS client config");

    let mut builder =
        SslConnector::builder(SslMethod::tls_client()).context("Failed to create SSL connector")?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .context("Failed to set min TLS version")?;

    builder.set_verify(SslVerifyMode::NONE);

    let cert = X509::from_der(&identity.certificate).context("Failed to parse certificate")?;
    let pkey = PKey::private_key_from_der(&identity.private_key)
        .context("Failed to parse private key")?;

    builder
        .set_certificate(&cert)
        .context("Failed to set certificate")?;
    builder
        .set_private_key(&pkey)
        .context("Failed to set private key")?;

    Ok(Arc::new(builder.build()))
}

/// Run the client handshake over an established TCP connection
pub async fn handshake(connector: &SslConnector, tcp: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = Ssl::new(connector.context()).context("Failed to create SSL session")?;
    let mut stream = SslStream::new(ssl, tcp).context("Failed to create TLS stream")?;
    Pin::new(&mut stream)
        .connect()
        .await
        .context("TLS handshake failed")?;
    Ok(stream)
}
