//! Pairing handshake state machine
//!
//! Runs over its own TLS connection to the pairing port:
//!
//! 1. TLS established → send `PairingRequest`
//! 2. `PairingRequestAck` → send `Options`
//! 3. `Options` → send `Configuration`
//! 4. `ConfigurationAck` → wait for the user's code
//! 5. [`PairingEngine::send_answer`] → send `Secret`
//! 6. `SecretAck` → `Successful`
//!
//! A response with a bad header, a disconnect, a TLS failure or the 5 second
//! connect timeout ends in `Failed`. Both terminal states release the socket.

use super::certificate::RsaPublicKey;
use super::secret::{compute_alpha, PairingAnswer};
use crate::host::{Handle, HandleKind, HostContext, IoEvent, SocketMode};
use crate::messages::{
    self, PairingMessage, CONFIGURATION_REQUEST, OPTIONS_REQUEST, PAIRING_HEADER, PAIRING_REQUEST,
};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Time allowed to connect and finish the TLS handshake
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pairing handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingState {
    Connecting,
    Connected,
    WaitingForAnswer,
    SendingAnswer,
    Successful,
    Failed,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Successful | PairingState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PairingState::Connecting => "Connecting",
            PairingState::Connected => "Connected",
            PairingState::WaitingForAnswer => "WaitingForAnswer",
            PairingState::SendingAnswer => "SendingAnswer",
            PairingState::Successful => "Successful",
            PairingState::Failed => "Failed",
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct PairingEngine {
    addr: SocketAddr,
    client_key: RsaPublicKey,
    server_key: RsaPublicKey,
    state: PairingState,
    socket: Option<Handle>,
    timer: Option<Handle>,
    buffer: Vec<u8>,
}

impl PairingEngine {
    /// Create an engine for the device at `addr`
    ///
    /// `client_key` is the driver's own key, `server_key` the key extracted
    /// from the device certificate.
    pub fn new(addr: SocketAddr, client_key: RsaPublicKey, server_key: RsaPublicKey) -> Self {
        Self {
            addr,
            client_key,
            server_key,
            state: PairingState::Connecting,
            socket: None,
            timer: None,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn start(&mut self, ctx: &mut HostContext<'_>) {
        info!("Starting pairing with {}", self.addr);
        self.state = PairingState::Connecting;
        self.socket = Some(ctx.open_socket(self.addr, SocketMode::Tls, HandleKind::PairingSocket));
        self.timer = Some(ctx.start_timer(PAIRING_TIMEOUT, HandleKind::PairingTimer));
    }

    pub fn on_socket_event(&mut self, ctx: &mut HostContext<'_>, handle: Handle, event: IoEvent) {
        if self.socket != Some(handle) || self.is_terminal() {
            debug!("Ignoring event for stale pairing socket {}", handle);
            return;
        }

        match event {
            IoEvent::Connected => {
                debug!("Pairing socket connected to {}, starting TLS", self.addr);
                self.state = PairingState::Connected;
                ctx.start_tls(handle);
            }
            IoEvent::TlsEstablished => {
                if let Some(timer) = self.timer.take() {
                    ctx.stop_timer(timer);
                }
                trace!("Sending pairing request to {}", self.addr);
                ctx.write(handle, PAIRING_REQUEST);
                self.state = PairingState::Connected;
            }
            IoEvent::TlsFailed => self.fail(ctx, "TLS handshake failed"),
            IoEvent::Disconnected => self.fail(ctx, "connection closed"),
            IoEvent::Data(data) => {
                self.buffer.extend_from_slice(&data);
                self.process_buffer(ctx);
            }
            IoEvent::TimerFired => {}
        }
    }

    pub fn on_timer(&mut self, ctx: &mut HostContext<'_>, handle: Handle) {
        if self.timer != Some(handle) {
            return;
        }
        ctx.timer_fired(handle);
        self.timer = None;
        self.fail(ctx, "timed out");
    }

    /// Send the proof derived from the code shown on the TV
    ///
    /// A malformed code is rejected without touching the handshake, so the
    /// user can try again.
    pub fn send_answer(&mut self, ctx: &mut HostContext<'_>, code: &str) -> Result<()> {
        if self.state != PairingState::WaitingForAnswer {
            return Err(ProtocolError::InvalidState(format!(
                "pairing with {} is {}, not waiting for an answer",
                self.addr, self.state
            )));
        }
        let socket = self
            .socket
            .ok_or_else(|| ProtocolError::NotConnected(format!("pairing socket to {}", self.addr)))?;

        let answer = PairingAnswer::parse(code)?;
        let alpha = compute_alpha(&self.client_key, &self.server_key, answer.nonce());

        if answer.check_byte() != Some(alpha[0]) {
            warn!(
                "Pairing code check byte does not match for {}, the code may be mistyped",
                self.addr
            );
        }

        let message = messages::secret(&alpha)?;
        trace!("Secret message: {}", hex::encode(&message));
        ctx.write(socket, &message);
        self.state = PairingState::SendingAnswer;
        Ok(())
    }

    /// Release the socket and timer
    pub fn close(&mut self, ctx: &mut HostContext<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.stop_timer(timer);
        }
        if let Some(socket) = self.socket.take() {
            ctx.close_socket(socket);
        }
        self.buffer.clear();
    }

    fn fail(&mut self, ctx: &mut HostContext<'_>, reason: &str) {
        warn!("Pairing with {} failed: {}", self.addr, reason);
        self.state = PairingState::Failed;
        self.close(ctx);
    }

    fn process_buffer(&mut self, ctx: &mut HostContext<'_>) {
        while let Some(&length) = self.buffer.first() {
            let length = length as usize;
            if self.buffer.len() < length + 1 {
                break;
            }

            let body: Vec<u8> = self.buffer.drain(..=length).skip(1).collect();
            if body.is_empty() {
                continue;
            }

            trace!("Pairing message from {}: {}", self.addr, hex::encode(&body));
            self.handle_message(ctx, &body);

            if self.is_terminal() {
                break;
            }
        }
    }

    fn handle_message(&mut self, ctx: &mut HostContext<'_>, body: &[u8]) {
        if !body.starts_with(PAIRING_HEADER) {
            self.fail(ctx, &format!("unexpected header {}", hex::encode(body)));
            return;
        }

        let Some(socket) = self.socket else {
            return;
        };

        let message = body
            .get(PAIRING_HEADER.len())
            .and_then(|&b| PairingMessage::from_discriminator(b));

        match message {
            Some(PairingMessage::PairingRequestAck) => {
                ctx.write(socket, OPTIONS_REQUEST);
            }
            Some(PairingMessage::Options) => {
                ctx.write(socket, CONFIGURATION_REQUEST);
            }
            Some(PairingMessage::ConfigurationAck) => {
                info!("{} is showing a pairing code", self.addr);
                self.state = PairingState::WaitingForAnswer;
            }
            Some(PairingMessage::SecretAck) => {
                info!("Pairing with {} succeeded", self.addr);
                self.state = PairingState::Successful;
                self.close(ctx);
            }
            None => debug!("Ignoring pairing message {}", hex::encode(body)),
        }
    }
}
