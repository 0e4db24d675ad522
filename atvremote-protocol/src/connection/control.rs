//! Control channel state machine
//!
//! One long-lived TLS connection per device on the control port. It carries
//! key presses and app links to the TV and ping keepalives from it.
//!
//! ## States
//!
//! ```text
//! Disconnected --connect--> Connected --TLS--> Paired --SetActive--> Configured
//! ```
//!
//! `Failed` ranks below `Disconnected` and is sticky: a plain transition to
//! `Disconnected` does not overwrite it. Only a new connection leaves it.
//!
//! ## Keepalive
//!
//! The TV pings roughly every few seconds. If no ping arrives within
//! [`PING_TIMEOUT`] the missed ping count goes up; once it exceeds
//! [`MAX_MISSED_PINGS`] the channel reconnects.

use crate::codec::{decode_continuation_length, FieldReader, FieldValue};
use crate::host::{Handle, HandleKind, HostContext, IoEvent, SocketMode};
use crate::messages::{self, control_field, KeyAction, ACTIVE_ACK, CONFIGURE_ACK};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Time allowed from connect attempt to TLS established
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Expected maximum interval between pings from the TV
pub const PING_TIMEOUT: Duration = Duration::from_secs(120);

/// Delay before reconnecting after a failure
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Missed pings tolerated before reconnecting
pub const MAX_MISSED_PINGS: u32 = 2;

/// Control channel status, ordered from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControlState {
    Failed,
    Disconnected,
    Connected,
    Paired,
    Configured,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlState::Failed => "Failed",
            ControlState::Disconnected => "Disconnected",
            ControlState::Connected => "Connected",
            ControlState::Paired => "Paired",
            ControlState::Configured => "Configured",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct ControlChannel {
    addr: SocketAddr,
    state: ControlState,
    missed_pings: u32,
    socket: Option<Handle>,
    connect_timer: Option<Handle>,
    ping_timer: Option<Handle>,
    reconnect_timer: Option<Handle>,
    buffer: Vec<u8>,
    pending_len: Option<usize>,
}

impl ControlChannel {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: ControlState::Disconnected,
            missed_pings: 0,
            socket: None,
            connect_timer: None,
            ping_timer: None,
            reconnect_timer: None,
            buffer: Vec::new(),
            pending_len: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn missed_pings(&self) -> u32 {
        self.missed_pings
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open the connection and arm the connect timeout
    pub fn connect(&mut self, ctx: &mut HostContext<'_>) {
        if let Some(socket) = self.socket.take() {
            ctx.close_socket(socket);
        }
        if let Some(timer) = self.connect_timer.take() {
            ctx.stop_timer(timer);
        }

        debug!("Connecting control channel to {}", self.addr);
        self.buffer.clear();
        self.pending_len = None;
        self.socket = Some(ctx.open_socket(self.addr, SocketMode::Tls, HandleKind::ControlSocket));
        self.connect_timer = Some(ctx.start_timer(CONNECT_TIMEOUT, HandleKind::ControlConnectTimer));
    }

    /// Tear down the connection and connect again after `delay`
    pub fn reconnect(&mut self, ctx: &mut HostContext<'_>, delay: Duration) {
        if let Some(timer) = self.reconnect_timer.take() {
            ctx.stop_timer(timer);
        }
        self.teardown(ctx);
        self.set_state(ControlState::Disconnected);

        debug!("Reconnecting to {} in {:?}", self.addr, delay);
        self.reconnect_timer = Some(ctx.start_timer(delay, HandleKind::ControlReconnectTimer));
    }

    /// Close everything without scheduling a reconnect
    pub fn close(&mut self, ctx: &mut HostContext<'_>) {
        if let Some(timer) = self.reconnect_timer.take() {
            ctx.stop_timer(timer);
        }
        self.teardown(ctx);
        self.state = ControlState::Disconnected;
    }

    pub fn on_socket_event(&mut self, ctx: &mut HostContext<'_>, handle: Handle, event: IoEvent) {
        if self.socket != Some(handle) {
            debug!("Ignoring event for stale control socket {}", handle);
            return;
        }

        match event {
            IoEvent::Connected => {
                info!("Control channel connected to {}", self.addr);
                self.set_state(ControlState::Connected);
                if let Some(timer) = self.reconnect_timer.take() {
                    ctx.stop_timer(timer);
                }
                ctx.start_tls(handle);
            }
            IoEvent::TlsEstablished => {
                if let Some(timer) = self.connect_timer.take() {
                    ctx.stop_timer(timer);
                }
                self.missed_pings = 0;
                self.set_state(ControlState::Paired);
                self.reschedule_ping_timer(ctx);
            }
            IoEvent::TlsFailed => {
                warn!("TLS handshake with {} failed, device may need pairing", self.addr);
                self.reconnect(ctx, RECONNECT_DELAY);
            }
            IoEvent::Disconnected => {
                info!("Control channel to {} closed", self.addr);
                self.reconnect(ctx, RECONNECT_DELAY);
            }
            IoEvent::Data(data) => {
                self.buffer.extend_from_slice(&data);
                if let Err(e) = self.process_buffer(ctx) {
                    if e.is_recoverable() {
                        info!("Control channel to {} interrupted: {}", self.addr, e);
                    } else {
                        warn!("Protocol error on control channel to {}: {}", self.addr, e);
                        self.set_state(ControlState::Failed);
                    }
                    self.reconnect(ctx, RECONNECT_DELAY);
                }
            }
            IoEvent::TimerFired => {}
        }
    }

    pub fn on_timer(&mut self, ctx: &mut HostContext<'_>, kind: HandleKind, handle: Handle) {
        match kind {
            HandleKind::ControlConnectTimer if self.connect_timer == Some(handle) => {
                ctx.timer_fired(handle);
                self.connect_timer = None;
                warn!("Connecting to {} timed out", self.addr);
                self.set_state(ControlState::Failed);
                self.reconnect(ctx, RECONNECT_DELAY);
            }
            HandleKind::ControlPingTimer if self.ping_timer == Some(handle) => {
                ctx.timer_fired(handle);
                self.ping_timer = None;
                self.on_ping_timeout(ctx);
            }
            HandleKind::ControlReconnectTimer if self.reconnect_timer == Some(handle) => {
                ctx.timer_fired(handle);
                self.reconnect_timer = None;
                self.connect(ctx);
            }
            _ => debug!("Ignoring stale {:?} {}", kind, handle),
        }
    }

    pub fn send_key(&mut self, ctx: &mut HostContext<'_>, key_code: u32, action: KeyAction) -> Result<()> {
        let socket = self.ready_socket()?;
        let message = messages::key_inject(key_code, action)?;
        trace!("Key {} {:?} to {}", key_code, action, self.addr);
        ctx.write(socket, &message);
        Ok(())
    }

    pub fn send_intent(&mut self, ctx: &mut HostContext<'_>, uri: &str) -> Result<()> {
        let socket = self.ready_socket()?;
        let message = messages::app_link_launch(uri)?;
        debug!("Launching {} on {}", uri, self.addr);
        ctx.write(socket, &message);
        Ok(())
    }

    fn ready_socket(&self) -> Result<Handle> {
        match self.socket {
            Some(socket) if self.state >= ControlState::Paired => Ok(socket),
            _ => Err(ProtocolError::NotConnected(format!(
                "control channel to {} is {}",
                self.addr, self.state
            ))),
        }
    }

    fn set_state(&mut self, state: ControlState) {
        if self.state == ControlState::Failed && state == ControlState::Disconnected {
            trace!("{} stays Failed", self.addr);
            return;
        }
        if self.state != state {
            debug!("Control channel {}: {} -> {}", self.addr, self.state, state);
        }
        self.state = state;
    }

    fn teardown(&mut self, ctx: &mut HostContext<'_>) {
        for timer in [self.connect_timer.take(), self.ping_timer.take()].into_iter().flatten() {
            ctx.stop_timer(timer);
        }
        if let Some(socket) = self.socket.take() {
            ctx.close_socket(socket);
        }
        self.buffer.clear();
        self.pending_len = None;
    }

    fn reschedule_ping_timer(&mut self, ctx: &mut HostContext<'_>) {
        if self.state <= ControlState::Disconnected {
            return;
        }
        if let Some(timer) = self.ping_timer.take() {
            ctx.stop_timer(timer);
        }
        self.ping_timer = Some(ctx.start_timer(PING_TIMEOUT, HandleKind::ControlPingTimer));
    }

    fn on_ping_timeout(&mut self, ctx: &mut HostContext<'_>) {
        if self.state <= ControlState::Disconnected {
            return;
        }

        self.missed_pings += 1;
        warn!("Missed ping {} from {}", self.missed_pings, self.addr);
        if self.missed_pings > MAX_MISSED_PINGS {
            self.reconnect(ctx, RECONNECT_DELAY);
        }
        // no-op after a reconnect, the state is Disconnected by then
        self.reschedule_ping_timer(ctx);
    }

    fn process_buffer(&mut self, ctx: &mut HostContext<'_>) -> Result<()> {
        loop {
            let length = match self.pending_len {
                Some(length) => length,
                None => match decode_continuation_length(&self.buffer)? {
                    Some((length, used)) => {
                        self.buffer.drain(..used);
                        self.pending_len = Some(length);
                        length
                    }
                    None => return Ok(()),
                },
            };

            if self.buffer.len() < length {
                return Ok(());
            }

            let body: Vec<u8> = self.buffer.drain(..length).collect();
            self.pending_len = None;
            if body.is_empty() {
                continue;
            }

            trace!("Control message from {}: {}", self.addr, hex::encode(&body));
            self.handle_message(ctx, &body)?;

            if self.socket.is_none() {
                return Ok(());
            }
        }
    }

    fn handle_message(&mut self, ctx: &mut HostContext<'_>, body: &[u8]) -> Result<()> {
        let Some(socket) = self.socket else {
            return Ok(());
        };

        let mut reader = FieldReader::new(body);
        let Some((field, value)) = reader.next_field()? else {
            return Ok(());
        };

        match (field, value) {
            (control_field::CONFIGURE, _) => {
                debug!("{} sent Configure", self.addr);
                ctx.write(socket, CONFIGURE_ACK);
            }
            (control_field::SET_ACTIVE, _) => {
                self.set_state(ControlState::Configured);
                ctx.write(socket, ACTIVE_ACK);
            }
            (control_field::PING_REQUEST, FieldValue::Bytes(inner)) => {
                self.missed_pings = 0;
                let count = ping_count(inner)?;
                trace!("Ping {} from {}", count, self.addr);
                match u32::try_from(count).map_err(|_| ProtocolError::EncodingLimit(count)).and_then(messages::pong) {
                    Ok(pong) => ctx.write(socket, &pong),
                    Err(e) => warn!("Cannot answer ping {} from {}: {}", count, self.addr, e),
                }
                self.reschedule_ping_timer(ctx);
            }
            (field, _) => debug!("Ignoring control message field {} from {}", field, self.addr),
        }
        Ok(())
    }
}

/// First field 1 varint of a ping request, 0 if absent
fn ping_count(inner: &[u8]) -> Result<u64> {
    let mut reader = FieldReader::new(inner);
    while let Some((field, value)) = reader.next_field()? {
        if let (1, FieldValue::Varint(count)) = (field, value) {
            return Ok(count);
        }
    }
    Ok(0)
}
