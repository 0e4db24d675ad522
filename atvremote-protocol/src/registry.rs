//! Device Registry
//!
//! Owns every configured device and routes host events to them. Host
//! callbacks only carry a [`Handle`]; the registry's [`HandleTable`] maps it
//! back to the owning device and sub-connection. Devices never touch the
//! table themselves: each dispatch runs against a [`HostContext`] whose
//! recorded handle changes are applied here afterwards.
//!
//! State changes are published as [`DeviceEvent`]s on an unbounded channel
//! for the configuration UI and any other observer.

use crate::configuration::{ConfigurationRequest, DeviceStateSnapshot};
use crate::connection::ControlState;
use crate::device::{Device, DeviceConfig};
use crate::handles::HandleTable;
use crate::host::{Handle, Host, HostContext, IoEvent};
use crate::media::{cover_art_url, format_media_time, MediaMessage, MediaPayload, MediaStateChanged};
use crate::pairing::{PairingState, RsaPublicKey};
use crate::{ProtocolError, Result, CONTROL_PORT, PAIRING_PORT};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Ports and addresses shared by all devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub control_port: u16,
    pub pairing_port: u16,
    /// Port of the local media bridge, advertised to the companion app
    pub media_port: u16,
    /// Address of this host as seen by the TVs
    pub host_ip: Option<IpAddr>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            control_port: CONTROL_PORT,
            pairing_port: PAIRING_PORT,
            media_port: 6468,
            host_ip: None,
        }
    }
}

/// Now-playing information of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowPlaying {
    pub app_name: String,
    pub package_name: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// URL of the album art, served by the media bridge when the TV sent the image itself
    pub album_art_uri: Option<String>,
    /// Track length as `HH:MM:SS`
    pub duration: String,
}

/// Device registry events
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Control or pairing state of a device changed
    StateChanged {
        index: usize,
        control_state: ControlState,
        pairing_state: Option<PairingState>,
    },

    /// The companion app reported a new track or app
    MediaMetadataChanged {
        index: usize,
        now_playing: NowPlaying,
    },

    /// Playback position or play state changed
    PlaybackChanged {
        index: usize,
        is_playing: bool,
        /// Elapsed time as `HH:MM:SS`
        elapsed: String,
        /// Percent of the track played
        progress: u32,
    },

    /// The companion app reported an error
    MediaError { index: usize, message: String },
}

pub struct DeviceRegistry {
    config: RegistryConfig,
    devices: Vec<Device>,
    handles: HandleTable,
    published: Vec<(ControlState, Option<PairingState>)>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceRegistry {
    /// Create a registry for `devices`, indexed from 1 in the given order
    pub fn new(
        config: RegistryConfig,
        devices: Vec<DeviceConfig>,
        client_key: RsaPublicKey,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        if devices.is_empty() {
            return Err(ProtocolError::Configuration("no devices configured".to_string()));
        }

        let devices: Vec<Device> = devices
            .into_iter()
            .enumerate()
            .map(|(i, device)| {
                Device::new(
                    i + 1,
                    device,
                    config.control_port,
                    config.pairing_port,
                    client_key.clone(),
                )
            })
            .collect();
        let published = devices
            .iter()
            .map(|d| (d.control_state(), d.pairing_state()))
            .collect();

        let (events, receiver) = mpsc::unbounded_channel();
        info!("Registry created with {} devices", devices.len());

        Ok((
            Self {
                config,
                devices,
                handles: HandleTable::new(),
                published,
                events,
            },
            receiver,
        ))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device by 1-based index
    pub fn device(&self, index: usize) -> Option<&Device> {
        index.checked_sub(1).and_then(|i| self.devices.get(i))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Open every device's control channel
    pub fn start(&mut self, host: &mut dyn Host) {
        for index in 1..=self.devices.len() {
            if let Err(e) = self.with_device(host, index, |device, ctx| device.start(ctx)) {
                warn!("Could not start device {}: {}", index, e);
            }
        }
    }

    /// Route a host event to the owner of `handle`
    ///
    /// Events for handles that are no longer registered are dropped.
    pub fn handle_io(&mut self, host: &mut dyn Host, handle: Handle, event: IoEvent) {
        let Some(route) = self.handles.resolve(handle) else {
            trace!("Dropping {:?} for unknown handle {}", event, handle);
            return;
        };

        if let Err(e) = self.with_device(host, route.device, |device, ctx| {
            device.dispatch(ctx, route.kind, handle, event)
        }) {
            warn!("Could not dispatch event for handle {}: {}", handle, e);
        }
    }

    pub fn initiate_pairing(&mut self, host: &mut dyn Host, index: usize) -> Result<()> {
        self.with_device(host, index, |device, ctx| device.initiate_pairing(ctx))
    }

    pub fn send_answer(&mut self, host: &mut dyn Host, index: usize, answer: &str) -> Result<()> {
        self.with_device(host, index, |device, ctx| device.send_answer(ctx, answer))?
    }

    pub fn send_key(&mut self, host: &mut dyn Host, index: usize, key_code: u32) -> Result<()> {
        self.with_device(host, index, |device, ctx| device.send_key(ctx, key_code))?
    }

    pub fn send_intent(
        &mut self,
        host: &mut dyn Host,
        index: usize,
        uri: &str,
        package: Option<&str>,
    ) -> Result<()> {
        self.with_device(host, index, |device, ctx| device.send_intent(ctx, uri, package))?
    }

    /// Point the device's companion app at this host's media bridge
    pub fn configure_companion_app(&mut self, host: &mut dyn Host, index: usize) -> Result<()> {
        let host_ip = self.config.host_ip.ok_or_else(|| {
            ProtocolError::Configuration("host_ip is required to configure the companion app".to_string())
        })?;
        let media_port = self.config.media_port;
        self.with_device(host, index, |device, ctx| {
            device.configure_companion_app(ctx, host_ip, media_port)
        })?
    }

    pub fn install_companion_app(&mut self, host: &mut dyn Host, index: usize) -> Result<()> {
        self.with_device(host, index, |device, ctx| device.install_companion_app(ctx))?
    }

    /// Execute a request from the configuration UI
    pub fn apply_request(&mut self, host: &mut dyn Host, request: ConfigurationRequest) -> Result<()> {
        debug!("Configuration request {:?}", request);
        match request {
            ConfigurationRequest::InitiatePairing { device_index } => {
                self.initiate_pairing(host, device_index)
            }
            ConfigurationRequest::SendAnswer { device_index, answer } => {
                self.send_answer(host, device_index, &answer)
            }
            ConfigurationRequest::ConfigureCompanionApp { device_index } => {
                self.configure_companion_app(host, device_index)
            }
            ConfigurationRequest::InstallCompanionApp { device_index } => {
                self.install_companion_app(host, device_index)
            }
        }
    }

    /// Apply a media bridge message to its device
    pub fn apply_media(&mut self, message: MediaMessage) -> Result<()> {
        let index = message.device_index;
        let host_ip = self.config.host_ip;
        let media_port = self.config.media_port;
        let device = self.device_mut(index)?;

        let event = match message.payload {
            MediaPayload::MediaStateChanged(state) => {
                device.apply_media_state(&state);
                let now_playing = now_playing(index, &state, host_ip, media_port);
                debug!("Device {} now playing {:?}", index, now_playing.title);
                DeviceEvent::MediaMetadataChanged { index, now_playing }
            }
            MediaPayload::PlaybackStateChanged(playback) => {
                device.apply_playback(&playback);
                playback_event(device)
            }
            MediaPayload::ServiceErrorEncountered(error) => {
                let message = error.error_message.unwrap_or_default();
                warn!("Companion app on device {} reported: {}", index, message);
                DeviceEvent::MediaError { index, message }
            }
        };
        self.publish(event);
        Ok(())
    }

    /// Extrapolate playback positions of all playing devices
    pub fn advance_media_position(&mut self, elapsed: Duration) {
        let mut events = Vec::new();
        for device in &mut self.devices {
            if device.advance_media_position(elapsed) {
                events.push(playback_event(device));
            }
        }
        for event in events {
            self.publish(event);
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceStateSnapshot> {
        self.devices.iter().map(Device::snapshot).collect()
    }

    /// Close every connection and timer
    pub fn shutdown(&mut self, host: &mut dyn Host) {
        info!("Shutting down {} devices", self.devices.len());
        for index in 1..=self.devices.len() {
            if let Err(e) = self.with_device(host, index, |device, ctx| device.shutdown(ctx)) {
                warn!("Could not shut down device {}: {}", index, e);
            }
        }
        if !self.handles.is_empty() {
            warn!("{} handles still registered after shutdown", self.handles.len());
        }
    }

    fn device_mut(&mut self, index: usize) -> Result<&mut Device> {
        index
            .checked_sub(1)
            .and_then(|i| self.devices.get_mut(i))
            .ok_or(ProtocolError::DeviceNotFound(index))
    }

    /// Run `f` against one device, then apply its handle changes and
    /// publish any state change
    fn with_device<T>(
        &mut self,
        host: &mut dyn Host,
        index: usize,
        f: impl FnOnce(&mut Device, &mut HostContext<'_>) -> T,
    ) -> Result<T> {
        let device = self.device_mut(index)?;
        let mut ctx = HostContext::new(host);
        let result = f(device, &mut ctx);
        self.handles.apply(index, ctx.into_changes());
        self.publish_state(index);
        Ok(result)
    }

    fn publish_state(&mut self, index: usize) {
        let Some(device) = self.device(index) else {
            return;
        };
        let current = (device.control_state(), device.pairing_state());
        let Some(published) = self.published.get_mut(index - 1) else {
            return;
        };
        if *published == current {
            return;
        }
        *published = current;

        let (control_state, pairing_state) = current;
        debug!(
            "Device {} state: control {}, pairing {:?}",
            index, control_state, pairing_state
        );
        self.publish(DeviceEvent::StateChanged {
            index,
            control_state,
            pairing_state,
        });
    }

    fn publish(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for device events");
        }
    }
}

fn playback_event(device: &Device) -> DeviceEvent {
    let playback = device.playback();
    DeviceEvent::PlaybackChanged {
        index: device.index(),
        is_playing: playback.is_playing,
        elapsed: playback.elapsed_text(),
        progress: playback.progress_percent(),
    }
}

fn now_playing(
    index: usize,
    state: &MediaStateChanged,
    host_ip: Option<IpAddr>,
    media_port: u16,
) -> NowPlaying {
    let metadata = state.metadata.clone().unwrap_or_default();

    let has_album_art = metadata.album_art.as_deref().is_some_and(|a| !a.is_empty());
    let album_art_uri = match metadata.album_art_uri.filter(|u| !u.is_empty()) {
        Some(uri) => Some(uri),
        None if has_album_art => match host_ip {
            Some(ip) => Some(cover_art_url(&ip.to_string(), media_port, index, cache_buster())),
            None => {
                debug!("No host_ip configured, cannot serve cover art of device {}", index);
                None
            }
        },
        None => None,
    };

    NowPlaying {
        app_name: state.app_name.clone().unwrap_or_default(),
        package_name: state.package_name.clone().unwrap_or_default(),
        title: metadata.title.unwrap_or_default(),
        artist: metadata.artist.unwrap_or_default(),
        album: metadata.album.unwrap_or_default(),
        album_art_uri,
        duration: format_media_time(metadata.duration.unwrap_or(0)),
    }
}

fn cache_buster() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use crate::host::HandleKind;
    use crate::media::{MediaMetadata, PlaybackDetails, PlaybackStateChanged, ServiceError, STATE_PLAYING};
    use crate::test_support::CLIENT_DER;

    fn device_config(name: &str, ip: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            ip_address: ip.parse().unwrap(),
            use_companion_app: false,
        }
    }

    fn registry(config: RegistryConfig) -> (DeviceRegistry, mpsc::UnboundedReceiver<DeviceEvent>) {
        let client_key = RsaPublicKey::from_der_certificate(CLIENT_DER).unwrap();
        DeviceRegistry::new(
            config,
            vec![
                device_config("Living Room", "192.168.1.40"),
                device_config("Bedroom", "192.168.1.41"),
            ],
            client_key,
        )
        .unwrap()
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn control_socket(registry: &DeviceRegistry, index: usize) -> Handle {
        registry
            .handles()
            .handles_for(index)
            .into_iter()
            .find(|(_, kind)| *kind == HandleKind::ControlSocket)
            .map(|(h, _)| h)
            .unwrap()
    }

    #[test]
    fn test_zero_devices_rejected() {
        let client_key = RsaPublicKey::from_der_certificate(CLIENT_DER).unwrap();
        let result = DeviceRegistry::new(RegistryConfig::default(), Vec::new(), client_key);
        assert!(matches!(result, Err(ProtocolError::Configuration(_))));
    }

    #[test]
    fn test_start_registers_control_handles() {
        let mut host = MockHost::new();
        let (mut registry, _events) = registry(RegistryConfig::default());
        registry.start(&mut host);

        assert_eq!(registry.handles().count(HandleKind::ControlSocket), 2);
        assert_eq!(registry.handles().count(HandleKind::ControlConnectTimer), 2);
        assert_eq!(host.opened[0].1.port(), 6466);
        assert_eq!(host.opened[1].1.ip().to_string(), "192.168.1.41");
    }

    #[test]
    fn test_device_index_bounds() {
        let mut host = MockHost::new();
        let (mut registry, _events) = registry(RegistryConfig::default());

        assert!(matches!(
            registry.initiate_pairing(&mut host, 0),
            Err(ProtocolError::DeviceNotFound(0))
        ));
        assert!(matches!(
            registry.send_key(&mut host, 3, 19),
            Err(ProtocolError::DeviceNotFound(3))
        ));
        assert!(registry.device(1).is_some());
        assert!(registry.device(0).is_none());
    }

    #[test]
    fn test_unknown_handle_is_noop() {
        let mut host = MockHost::new();
        let (mut registry, mut events) = registry(RegistryConfig::default());
        registry.start(&mut host);
        drain(&mut events);

        registry.handle_io(&mut host, Handle(9999), IoEvent::Data(vec![1, 2, 3]));
        registry.handle_io(&mut host, Handle(9999), IoEvent::TimerFired);
        assert!(host.writes.is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_state_changes_are_published() {
        let mut host = MockHost::new();
        let (mut registry, mut events) = registry(RegistryConfig::default());
        registry.start(&mut host);

        let socket = control_socket(&registry, 1);
        registry.handle_io(&mut host, socket, IoEvent::Connected);
        registry.handle_io(&mut host, socket, IoEvent::TlsEstablished);

        assert_eq!(
            drain(&mut events),
            vec![
                DeviceEvent::StateChanged {
                    index: 1,
                    control_state: ControlState::Connected,
                    pairing_state: None,
                },
                DeviceEvent::StateChanged {
                    index: 1,
                    control_state: ControlState::Paired,
                    pairing_state: None,
                },
            ]
        );
        assert_eq!(registry.handles().count(HandleKind::ControlPingTimer), 1);
        assert_eq!(registry.handles().count(HandleKind::ControlConnectTimer), 1);
    }

    #[test]
    fn test_devices_are_isolated() {
        let mut host = MockHost::new();
        let (mut registry, _events) = registry(RegistryConfig::default());
        registry.start(&mut host);

        let socket = control_socket(&registry, 2);
        registry.handle_io(&mut host, socket, IoEvent::Connected);
        registry.handle_io(&mut host, socket, IoEvent::Disconnected);

        assert_eq!(registry.device(1).unwrap().control_state(), ControlState::Disconnected);
        assert_eq!(registry.handles().count(HandleKind::ControlSocket), 1);
        assert_eq!(registry.handles().handles_for(1).len(), 2);
        assert_eq!(host.closed, vec![socket]);
    }

    #[test]
    fn test_fired_timer_is_released() {
        let mut host = MockHost::new();
        let (mut registry, _events) = registry(RegistryConfig::default());
        registry.start(&mut host);

        let timer = registry
            .handles()
            .handles_for(1)
            .into_iter()
            .find(|(_, kind)| *kind == HandleKind::ControlConnectTimer)
            .map(|(h, _)| h)
            .unwrap();
        host.fire(timer);
        registry.handle_io(&mut host, timer, IoEvent::TimerFired);

        assert!(registry.handles().resolve(timer).is_none());
        assert_eq!(registry.device(1).unwrap().control_state(), ControlState::Failed);
        assert_eq!(registry.handles().count(HandleKind::ControlReconnectTimer), 1);

        // a late duplicate delivery is ignored
        registry.handle_io(&mut host, timer, IoEvent::TimerFired);
        assert_eq!(registry.handles().count(HandleKind::ControlReconnectTimer), 1);
    }

    #[test]
    fn test_apply_request_routes_to_device() {
        let mut host = MockHost::new();
        let (mut registry, mut events) = registry(RegistryConfig::default());

        registry
            .apply_request(&mut host, ConfigurationRequest::InitiatePairing { device_index: 2 })
            .unwrap();
        assert_eq!(registry.handles().count(HandleKind::CertSocket), 1);
        assert_eq!(registry.snapshot()[1].pairing_state, "Connecting");
        assert_eq!(registry.snapshot()[0].pairing_state, "");
        assert_eq!(
            drain(&mut events),
            vec![DeviceEvent::StateChanged {
                index: 2,
                control_state: ControlState::Disconnected,
                pairing_state: Some(PairingState::Connecting),
            }]
        );

        let err = registry
            .apply_request(
                &mut host,
                ConfigurationRequest::SendAnswer {
                    device_index: 2,
                    answer: "3C4F21".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
    }

    #[test]
    fn test_configure_companion_requires_host_ip() {
        let mut host = MockHost::new();
        let (mut registry, _events) = registry(RegistryConfig::default());
        assert!(matches!(
            registry.configure_companion_app(&mut host, 1),
            Err(ProtocolError::Configuration(_))
        ));

        let (mut registry, _events) = registry_with_host_ip();
        assert!(matches!(
            registry.configure_companion_app(&mut host, 1),
            Err(ProtocolError::NotConnected(_))
        ));
    }

    fn registry_with_host_ip() -> (DeviceRegistry, mpsc::UnboundedReceiver<DeviceEvent>) {
        registry(RegistryConfig {
            host_ip: Some("192.168.1.10".parse().unwrap()),
            ..RegistryConfig::default()
        })
    }

    #[test]
    fn test_apply_media_state_synthesizes_cover_url() {
        let (mut registry, mut events) = registry_with_host_ip();

        let message = MediaMessage {
            device_index: 2,
            payload: MediaPayload::MediaStateChanged(MediaStateChanged {
                app_name: Some("Spotify".into()),
                package_name: Some("com.spotify.tv.android".into()),
                metadata: Some(MediaMetadata {
                    title: Some("Song".into()),
                    album_art: Some("/9j/".into()),
                    duration: Some(215_000),
                    ..Default::default()
                }),
            }),
        };
        registry.apply_media(message).unwrap();

        let events = drain(&mut events);
        let [DeviceEvent::MediaMetadataChanged { index, now_playing }] = events.as_slice() else {
            panic!("unexpected events {:?}", events);
        };
        assert_eq!(*index, 2);
        assert_eq!(now_playing.title, "Song");
        assert_eq!(now_playing.duration, "00:03:35");
        assert!(now_playing
            .album_art_uri
            .as_deref()
            .unwrap()
            .starts_with("http://192.168.1.10:6468/coverart?deviceIndex=02&cb="));
        assert_eq!(registry.device(2).unwrap().playback().duration_ms, 215_000);
    }

    #[test]
    fn test_playback_and_ticker() {
        let (mut registry, mut events) = registry(RegistryConfig::default());

        registry
            .apply_media(MediaMessage {
                device_index: 1,
                payload: MediaPayload::PlaybackStateChanged(PlaybackStateChanged {
                    playback_state: Some(PlaybackDetails {
                        state: STATE_PLAYING,
                        position: 61_000,
                        playback_speed: 1.0,
                    }),
                }),
            })
            .unwrap();
        assert_eq!(
            drain(&mut events),
            vec![DeviceEvent::PlaybackChanged {
                index: 1,
                is_playing: true,
                elapsed: "00:01:01".to_string(),
                progress: 0,
            }]
        );

        registry.advance_media_position(Duration::from_millis(250));
        assert_eq!(registry.device(1).unwrap().playback().position_ms, 61_250);
        assert_eq!(registry.device(2).unwrap().playback().position_ms, 0);
        assert_eq!(drain(&mut events).len(), 1);
    }

    #[test]
    fn test_media_error_and_unknown_device() {
        let (mut registry, mut events) = registry(RegistryConfig::default());

        registry
            .apply_media(MediaMessage {
                device_index: 1,
                payload: MediaPayload::ServiceErrorEncountered(ServiceError {
                    error_message: Some("notification access denied".into()),
                }),
            })
            .unwrap();
        assert_eq!(
            drain(&mut events),
            vec![DeviceEvent::MediaError {
                index: 1,
                message: "notification access denied".to_string(),
            }]
        );

        let err = registry
            .apply_media(MediaMessage {
                device_index: 7,
                payload: MediaPayload::MediaStateChanged(MediaStateChanged::default()),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(7)));
    }

    #[test]
    fn test_shutdown_releases_all_handles() {
        let mut host = MockHost::new();
        let (mut registry, _events) = registry(RegistryConfig::default());
        registry.start(&mut host);
        registry.initiate_pairing(&mut host, 1).unwrap();

        registry.shutdown(&mut host);
        assert!(registry.handles().is_empty());
        assert!(host.open_sockets.is_empty());
        assert!(host.timers.is_empty());
    }
}
