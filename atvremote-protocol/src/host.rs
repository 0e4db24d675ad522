//! Host Capability Interface
//!
//! The protocol engine never touches sockets or timers directly. It asks a
//! [`Host`] to start them and is told about their progress later through
//! [`IoEvent`]s keyed by an opaque [`Handle`]. All calls return immediately.
//!
//! State machines talk to the host through a [`HostContext`], which records
//! every handle that is created or torn down. The device registry applies
//! those records to its routing table after each dispatch, so it stays the
//! only writer of handle mappings.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Opaque identifier of a host socket or timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    ControlSocket,
    ControlPingTimer,
    ControlReconnectTimer,
    ControlConnectTimer,
    PairingSocket,
    PairingTimer,
    CertSocket,
    CertTimer,
    KeyReleaseTimer,
}

impl HandleKind {
    pub fn is_timer(self) -> bool {
        !matches!(
            self,
            HandleKind::ControlSocket | HandleKind::PairingSocket | HandleKind::CertSocket
        )
    }
}

/// How a socket is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Plain TCP, bytes are exchanged as-is
    Raw,
    /// TCP that is upgraded to TLS with [`Host::start_tls`] after connecting
    Tls,
}

/// Completion reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// TCP connection established
    Connected,
    /// Connection closed or failed to open
    Disconnected,
    /// Bytes received (decrypted for TLS sockets)
    Data(Vec<u8>),
    /// TLS handshake completed
    TlsEstablished,
    /// TLS handshake failed
    TlsFailed,
    /// One-shot timer expired
    TimerFired,
}

/// Socket and timer primitives provided by the embedding platform
pub trait Host {
    /// Start connecting to `addr`; [`IoEvent::Connected`] or
    /// [`IoEvent::Disconnected`] follows
    fn open_socket(&mut self, addr: SocketAddr, mode: SocketMode) -> Handle;

    /// Begin the TLS client handshake on a connected socket
    fn start_tls(&mut self, socket: Handle);

    /// Queue bytes for sending
    fn write(&mut self, socket: Handle, data: &[u8]);

    /// Close a socket; no further events are delivered for it
    fn close_socket(&mut self, socket: Handle);

    /// Start a one-shot timer
    fn start_timer(&mut self, delay: Duration) -> Handle;

    /// Cancel a timer that has not fired yet
    fn stop_timer(&mut self, timer: Handle);
}

/// A handle lifecycle record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleChange {
    Registered(Handle, HandleKind),
    Released(Handle),
}

/// Host access for one dispatch, recording handle lifecycle changes
pub struct HostContext<'a> {
    host: &'a mut dyn Host,
    changes: Vec<HandleChange>,
}

impl<'a> HostContext<'a> {
    pub fn new(host: &'a mut dyn Host) -> Self {
        Self {
            host,
            changes: Vec::new(),
        }
    }

    pub fn open_socket(&mut self, addr: SocketAddr, mode: SocketMode, kind: HandleKind) -> Handle {
        let handle = self.host.open_socket(addr, mode);
        self.changes.push(HandleChange::Registered(handle, kind));
        handle
    }

    pub fn start_tls(&mut self, socket: Handle) {
        self.host.start_tls(socket);
    }

    pub fn write(&mut self, socket: Handle, data: &[u8]) {
        self.host.write(socket, data);
    }

    pub fn close_socket(&mut self, socket: Handle) {
        self.host.close_socket(socket);
        self.changes.push(HandleChange::Released(socket));
    }

    pub fn start_timer(&mut self, delay: Duration, kind: HandleKind) -> Handle {
        let handle = self.host.start_timer(delay);
        self.changes.push(HandleChange::Registered(handle, kind));
        handle
    }

    pub fn stop_timer(&mut self, timer: Handle) {
        self.host.stop_timer(timer);
        self.changes.push(HandleChange::Released(timer));
    }

    /// Record that a one-shot timer has fired and its handle is dead
    pub fn timer_fired(&mut self, timer: Handle) {
        self.changes.push(HandleChange::Released(timer));
    }

    pub fn into_changes(self) -> Vec<HandleChange> {
        self.changes
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockHost;
    use super::*;

    #[test]
    fn test_context_records_lifecycle() {
        let mut host = MockHost::new();
        let addr: SocketAddr = "192.168.1.20:6466".parse().unwrap();

        let mut ctx = HostContext::new(&mut host);
        let socket = ctx.open_socket(addr, SocketMode::Tls, HandleKind::ControlSocket);
        let timer = ctx.start_timer(Duration::from_secs(5), HandleKind::ControlConnectTimer);
        ctx.stop_timer(timer);
        ctx.close_socket(socket);

        assert_eq!(
            ctx.into_changes(),
            vec![
                HandleChange::Registered(socket, HandleKind::ControlSocket),
                HandleChange::Registered(timer, HandleKind::ControlConnectTimer),
                HandleChange::Released(timer),
                HandleChange::Released(socket),
            ]
        );
        assert!(host.timers.is_empty());
        assert!(host.open_sockets.is_empty());
    }

    #[test]
    fn test_handle_kind_is_timer() {
        assert!(HandleKind::KeyReleaseTimer.is_timer());
        assert!(HandleKind::CertTimer.is_timer());
        assert!(!HandleKind::PairingSocket.is_timer());
    }
}
