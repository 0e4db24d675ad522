//! Integration Tests for the Android TV Remote Protocol
//!
//! These tests drive a [`DeviceRegistry`] through a recording host: the full
//! pairing flow from certificate extraction to the control channel
//! reconnect, plus handle routing across devices.

use atvremote_protocol::messages::{
    CLIENT_HELLO, CONFIGURATION_REQUEST, OPTIONS_REQUEST, PAIRING_REQUEST,
};
use atvremote_protocol::{
    CertificateInfo, ControlState, DeviceConfig, DeviceEvent, DeviceRegistry, Handle, HandleKind,
    Host, IoEvent, PairingState, RegistryConfig, RsaPublicKey, SocketMode,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const CLIENT_DER: &[u8] = include_bytes!("fixtures/client_cert.der");
const SERVER_DER: &[u8] = include_bytes!("fixtures/server_cert.der");

/// Host that records every request and never fires timers on its own
#[derive(Default)]
struct RecordingHost {
    next: u32,
    sockets: Vec<(Handle, SocketAddr, SocketMode)>,
    closed: Vec<Handle>,
    tls: Vec<Handle>,
    writes: Vec<(Handle, Vec<u8>)>,
    timers: BTreeMap<Handle, Duration>,
}

impl RecordingHost {
    fn last_socket(&self) -> Handle {
        self.sockets.last().map(|(h, _, _)| *h).unwrap()
    }

    fn take_writes(&mut self, socket: Handle) -> Vec<Vec<u8>> {
        let (mine, rest) = self.writes.drain(..).partition(|(h, _)| *h == socket);
        self.writes = rest;
        mine.into_iter().map(|(_, d)| d).collect()
    }

    fn fire(&mut self, timer: Handle) {
        assert!(self.timers.remove(&timer).is_some(), "timer {} not armed", timer);
    }
}

impl Host for RecordingHost {
    fn open_socket(&mut self, addr: SocketAddr, mode: SocketMode) -> Handle {
        self.next += 1;
        let handle = Handle(self.next);
        self.sockets.push((handle, addr, mode));
        handle
    }

    fn start_tls(&mut self, socket: Handle) {
        self.tls.push(socket);
    }

    fn write(&mut self, socket: Handle, data: &[u8]) {
        self.writes.push((socket, data.to_vec()));
    }

    fn close_socket(&mut self, socket: Handle) {
        self.closed.push(socket);
    }

    fn start_timer(&mut self, delay: Duration) -> Handle {
        self.next += 1;
        let handle = Handle(self.next);
        self.timers.insert(handle, delay);
        handle
    }

    fn stop_timer(&mut self, timer: Handle) {
        self.timers.remove(&timer);
    }
}

fn device(name: &str, ip: &str) -> DeviceConfig {
    DeviceConfig {
        name: name.to_string(),
        ip_address: ip.parse().unwrap(),
        use_companion_app: false,
    }
}

fn create_registry(devices: Vec<DeviceConfig>) -> (DeviceRegistry, UnboundedReceiver<DeviceEvent>) {
    let client_key = RsaPublicKey::from_der_certificate(CLIENT_DER).unwrap();
    DeviceRegistry::new(RegistryConfig::default(), devices, client_key).unwrap()
}

/// ServerHello and Certificate records from the pairing port
fn certificate_flight(der: &[u8]) -> Vec<u8> {
    fn record(body: &[u8]) -> Vec<u8> {
        let mut out = vec![22, 0x03, 0x03];
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    let len = der.len() as u32;
    let mut certificate = vec![11];
    certificate.extend_from_slice(&(len + 6).to_be_bytes()[1..]);
    certificate.extend_from_slice(&(len + 3).to_be_bytes()[1..]);
    certificate.extend_from_slice(&len.to_be_bytes()[1..]);
    certificate.extend_from_slice(der);

    let mut flight = record(&[2, 0x00, 0x00, 0x02, 0x03, 0x03]);
    flight.extend(record(&certificate));
    flight
}

/// Pairing message from the TV with status 200
fn tv_message(discriminator: u8) -> Vec<u8> {
    vec![0x07, 0x08, 0x02, 0x10, 0xc8, 0x01, discriminator, 0x00]
}

fn handle_of(registry: &DeviceRegistry, index: usize, kind: HandleKind) -> Handle {
    registry
        .handles()
        .handles_for(index)
        .into_iter()
        .find(|(_, k)| *k == kind)
        .map(|(h, _)| h)
        .unwrap_or_else(|| panic!("device {} has no {:?}", index, kind))
}

fn pairing_states(events: &mut UnboundedReceiver<DeviceEvent>) -> Vec<PairingState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::StateChanged {
            pairing_state: Some(state),
            ..
        } = event
        {
            states.push(state);
        }
    }
    states
}

#[tokio::test]
async fn test_full_pairing_flow() {
    let mut host = RecordingHost::default();
    let (mut registry, mut events) = create_registry(vec![device("Living Room", "192.168.1.40")]);
    registry.start(&mut host);
    let control_socket = handle_of(&registry, 1, HandleKind::ControlSocket);

    // certificate extraction over a raw socket
    registry.initiate_pairing(&mut host, 1).unwrap();
    let cert_socket = host.last_socket();
    assert_eq!(host.sockets.last().unwrap().2, SocketMode::Raw);
    assert_eq!(host.sockets.last().unwrap().1.port(), 6467);

    registry.handle_io(&mut host, cert_socket, IoEvent::Connected);
    assert_eq!(host.take_writes(cert_socket), vec![CLIENT_HELLO.to_vec()]);

    registry.handle_io(&mut host, cert_socket, IoEvent::Data(certificate_flight(SERVER_DER)));
    assert!(host.closed.contains(&cert_socket));
    assert_eq!(registry.handles().count(HandleKind::CertSocket), 0);
    assert_eq!(registry.handles().count(HandleKind::CertTimer), 0);

    // pairing handshake over TLS
    let pairing_socket = handle_of(&registry, 1, HandleKind::PairingSocket);
    assert_eq!(host.sockets.last().unwrap().2, SocketMode::Tls);
    registry.handle_io(&mut host, pairing_socket, IoEvent::Connected);
    assert_eq!(host.tls, vec![pairing_socket]);
    registry.handle_io(&mut host, pairing_socket, IoEvent::TlsEstablished);
    assert_eq!(registry.handles().count(HandleKind::PairingTimer), 0);
    assert_eq!(host.take_writes(pairing_socket), vec![PAIRING_REQUEST.to_vec()]);

    registry.handle_io(&mut host, pairing_socket, IoEvent::Data(tv_message(0x5a)));
    assert_eq!(host.take_writes(pairing_socket), vec![OPTIONS_REQUEST.to_vec()]);
    registry.handle_io(&mut host, pairing_socket, IoEvent::Data(tv_message(0xa2)));
    assert_eq!(host.take_writes(pairing_socket), vec![CONFIGURATION_REQUEST.to_vec()]);
    registry.handle_io(&mut host, pairing_socket, IoEvent::Data(tv_message(0xfa)));
    assert_eq!(
        registry.device(1).unwrap().pairing_state(),
        Some(PairingState::WaitingForAnswer)
    );

    // the code shown on the TV
    registry.send_answer(&mut host, 1, "3C4F21").unwrap();
    let writes = host.take_writes(pairing_socket);
    assert_eq!(
        hex::encode(&writes[0]),
        "2a080210c801c202220a20\
         3cfa93591bce6c12c4c540b4ae565f8d27cf251702067c9bae450204d6020ec3"
    );

    registry.handle_io(&mut host, pairing_socket, IoEvent::Data(tv_message(0xca)));
    assert_eq!(
        registry.device(1).unwrap().pairing_state(),
        Some(PairingState::Successful)
    );
    assert!(host.closed.contains(&pairing_socket));
    assert!(host.closed.contains(&control_socket));

    // the control channel reconnects immediately
    let reconnect = handle_of(&registry, 1, HandleKind::ControlReconnectTimer);
    assert_eq!(host.timers.get(&reconnect), Some(&Duration::ZERO));
    host.fire(reconnect);
    registry.handle_io(&mut host, reconnect, IoEvent::TimerFired);

    let new_control = handle_of(&registry, 1, HandleKind::ControlSocket);
    assert_ne!(new_control, control_socket);
    assert_eq!(host.sockets.last().unwrap().1.port(), 6466);

    assert_eq!(
        pairing_states(&mut events),
        vec![
            PairingState::Connecting,
            PairingState::Connected,
            PairingState::WaitingForAnswer,
            PairingState::SendingAnswer,
            PairingState::Successful,
        ]
    );
}

#[tokio::test]
async fn test_stale_handles_are_ignored() {
    let mut host = RecordingHost::default();
    let (mut registry, _events) = create_registry(vec![device("Living Room", "192.168.1.40")]);
    registry.start(&mut host);

    let socket = handle_of(&registry, 1, HandleKind::ControlSocket);
    registry.handle_io(&mut host, socket, IoEvent::Disconnected);
    assert!(registry.handles().resolve(socket).is_none());

    // delivered after teardown
    registry.handle_io(&mut host, socket, IoEvent::Data(vec![0x04, 0x42, 0x02, 0x08, 0x01]));
    registry.handle_io(&mut host, socket, IoEvent::Disconnected);
    assert!(host.writes.is_empty());
    assert_eq!(registry.handles().count(HandleKind::ControlReconnectTimer), 1);
}

#[tokio::test]
async fn test_pairing_on_one_device_leaves_others_alone() {
    let mut host = RecordingHost::default();
    let (mut registry, mut events) = create_registry(vec![
        device("Living Room", "192.168.1.40"),
        device("Bedroom", "192.168.1.41"),
    ]);
    registry.start(&mut host);

    registry.initiate_pairing(&mut host, 2).unwrap();
    let cert_socket = host.last_socket();
    registry.handle_io(&mut host, cert_socket, IoEvent::Disconnected);

    assert_eq!(registry.device(2).unwrap().pairing_state(), Some(PairingState::Failed));
    assert_eq!(registry.device(1).unwrap().pairing_state(), None);
    assert_eq!(registry.device(1).unwrap().control_state(), ControlState::Disconnected);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot[0].pairing_state, "");
    assert_eq!(snapshot[1].pairing_state, "Failed");
    assert_eq!(snapshot[1].ip_address, "192.168.1.41");

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        DeviceEvent::StateChanged {
            index: 2,
            control_state: ControlState::Disconnected,
            pairing_state: Some(PairingState::Connecting),
        }
    );
}

#[tokio::test]
async fn test_extraction_timeout() {
    let mut host = RecordingHost::default();
    let (mut registry, _events) = create_registry(vec![device("Living Room", "192.168.1.40")]);

    registry.initiate_pairing(&mut host, 1).unwrap();
    let timer = handle_of(&registry, 1, HandleKind::CertTimer);
    host.fire(timer);
    registry.handle_io(&mut host, timer, IoEvent::TimerFired);

    assert_eq!(registry.device(1).unwrap().pairing_state(), Some(PairingState::Failed));
    assert!(registry.handles().is_empty());
}

#[test]
fn test_identity_round_trip_feeds_registry() {
    let temp_dir = TempDir::new().unwrap();
    let cert_path = temp_dir.path().join("device_cert.pem");
    let key_path = temp_dir.path().join("device_key.pem");

    let identity = CertificateInfo::generate("atvremote").unwrap();
    identity.save_to_files(&cert_path, &key_path).unwrap();
    let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
    assert_eq!(loaded.fingerprint, identity.fingerprint);

    let client_key = loaded.public_key().unwrap();
    let result = DeviceRegistry::new(
        RegistryConfig::default(),
        vec![device("Living Room", "192.168.1.40")],
        client_key,
    );
    assert!(result.is_ok());
}
