//! Device certificate extraction
//!
//! Before pairing, the driver needs the RSA key of the TV's certificate.
//! It gets it without finishing a TLS handshake: a raw TCP connection to the
//! pairing port, a canned ClientHello, and just enough TLS record parsing to
//! pull the first certificate out of the server's Certificate message.
//!
//! ## Record Layout
//!
//! ```text
//! record:      type(1) major(1) minor(1) length(2)   body...
//! handshake:   type(1) length(3)                     body...
//! certificate: total(3) { length(3) der... }*
//! ```
//!
//! Parsing only consumes complete records, so the result does not depend on
//! how the byte stream is chunked.

use super::certificate::RsaPublicKey;
use crate::host::{Handle, HandleKind, HostContext, IoEvent, SocketMode};
use crate::messages::CLIENT_HELLO;
use crate::ProtocolError;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Time allowed for connecting and receiving the certificate
pub const CERT_TIMEOUT: Duration = Duration::from_secs(5);

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CERTIFICATE: u8 = 11;

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    content_type: u8,
    major: u8,
    minor: u8,
    length: usize,
}

fn read_u24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
}

/// Incremental TLS record parser that yields the first server certificate
#[derive(Debug, Default)]
pub struct TlsRecordReader {
    buffer: Vec<u8>,
    current: Option<RecordHeader>,
}

impl TlsRecordReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes; returns the DER of the first certificate once found
    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        loop {
            let header = match self.current {
                Some(header) => header,
                None => {
                    if self.buffer.len() < RECORD_HEADER_LEN {
                        return None;
                    }
                    let header = RecordHeader {
                        content_type: self.buffer[0],
                        major: self.buffer[1],
                        minor: self.buffer[2],
                        length: u16::from_be_bytes([self.buffer[3], self.buffer[4]]) as usize,
                    };
                    self.buffer.drain(..RECORD_HEADER_LEN);
                    self.current = Some(header);
                    header
                }
            };

            if self.buffer.len() < header.length {
                return None;
            }

            let record: Vec<u8> = self.buffer.drain(..header.length).collect();
            self.current = None;

            if header.content_type != CONTENT_TYPE_HANDSHAKE {
                trace!(
                    "Skipping TLS record type {} ({} bytes, version {}.{})",
                    header.content_type,
                    header.length,
                    header.major,
                    header.minor
                );
                continue;
            }

            match find_certificate(&record) {
                Ok(Some(der)) => return Some(der),
                Ok(None) => {}
                Err(e) => warn!("Discarding corrupt handshake record: {}", e),
            }
        }
    }
}

/// Walk the handshake messages of one record looking for a Certificate
fn find_certificate(record: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut pos = 0;
    while pos + HANDSHAKE_HEADER_LEN <= record.len() {
        let message_type = record[pos];
        let length = read_u24(&record[pos + 1..]);
        let start = pos + HANDSHAKE_HEADER_LEN;
        let end = start + length;

        if end > record.len() {
            return Err(ProtocolError::InvalidTlsRecord(format!(
                "handshake message type {} declares {} bytes, {} available",
                message_type,
                length,
                record.len() - start
            )));
        }

        if message_type == HANDSHAKE_TYPE_CERTIFICATE {
            return first_certificate(&record[start..end]).map(Some);
        }

        trace!("Skipping handshake message type {}", message_type);
        pos = end;
    }
    Ok(None)
}

fn first_certificate(message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if message.len() < 6 {
        return Err(ProtocolError::InvalidTlsRecord(
            "certificate message too short".to_string(),
        ));
    }

    let total = read_u24(message);
    if 3 + total > message.len() {
        return Err(ProtocolError::InvalidTlsRecord(format!(
            "certificate list declares {} bytes, {} available",
            total,
            message.len() - 3
        )));
    }

    let length = read_u24(&message[3..]);
    if 6 + length > 3 + total {
        return Err(ProtocolError::InvalidTlsRecord(format!(
            "certificate declares {} bytes, {} available",
            length,
            total.saturating_sub(3)
        )));
    }

    Ok(message[6..6 + length].to_vec())
}

/// Result of feeding an event to the extractor
#[derive(Debug)]
pub enum ExtractorOutcome {
    Pending,
    Extracted(RsaPublicKey),
    Failed(ProtocolError),
}

/// One-shot raw socket client that sniffs the pairing port certificate
#[derive(Debug)]
pub struct CertificateExtractor {
    addr: SocketAddr,
    socket: Option<Handle>,
    timer: Option<Handle>,
    reader: TlsRecordReader,
}

impl CertificateExtractor {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            socket: None,
            timer: None,
            reader: TlsRecordReader::new(),
        }
    }

    pub fn start(&mut self, ctx: &mut HostContext<'_>) {
        debug!("Fetching certificate from {}", self.addr);
        self.socket = Some(ctx.open_socket(self.addr, SocketMode::Raw, HandleKind::CertSocket));
        self.timer = Some(ctx.start_timer(CERT_TIMEOUT, HandleKind::CertTimer));
    }

    pub fn on_socket_event(
        &mut self,
        ctx: &mut HostContext<'_>,
        handle: Handle,
        event: IoEvent,
    ) -> ExtractorOutcome {
        if self.socket != Some(handle) {
            debug!("Ignoring event for stale certificate socket {}", handle);
            return ExtractorOutcome::Pending;
        }

        match event {
            IoEvent::Connected => {
                trace!("Sending ClientHello to {}", self.addr);
                ctx.write(handle, CLIENT_HELLO);
                ExtractorOutcome::Pending
            }
            IoEvent::Data(data) => {
                let Some(der) = self.reader.push(&data) else {
                    return ExtractorOutcome::Pending;
                };
                self.close(ctx);
                match RsaPublicKey::from_der_certificate(&der) {
                    Ok(key) => {
                        info!("Extracted {} byte certificate from {}", der.len(), self.addr);
                        ExtractorOutcome::Extracted(key)
                    }
                    Err(e) => ExtractorOutcome::Failed(e),
                }
            }
            IoEvent::Disconnected => {
                self.close(ctx);
                ExtractorOutcome::Failed(ProtocolError::Transport(format!(
                    "{} closed before sending a certificate",
                    self.addr
                )))
            }
            IoEvent::TlsEstablished | IoEvent::TlsFailed | IoEvent::TimerFired => {
                ExtractorOutcome::Pending
            }
        }
    }

    pub fn on_timer(&mut self, ctx: &mut HostContext<'_>, handle: Handle) -> ExtractorOutcome {
        if self.timer != Some(handle) {
            return ExtractorOutcome::Pending;
        }
        ctx.timer_fired(handle);
        self.timer = None;
        self.close(ctx);
        ExtractorOutcome::Failed(ProtocolError::Timeout(format!(
            "no certificate from {} within {:?}",
            self.addr, CERT_TIMEOUT
        )))
    }

    /// Release the socket and timer
    pub fn close(&mut self, ctx: &mut HostContext<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.stop_timer(timer);
        }
        if let Some(socket) = self.socket.take() {
            ctx.close_socket(socket);
        }
    }
}
