//! Android TV Device State
//!
//! A [`Device`] is one configured TV. It owns its control channel for the
//! whole process lifetime and at most one pairing sub-connection at a time.
//!
//! ## Pairing Lifecycle
//!
//! 1. **Extracting**: a raw socket fetches the TV's certificate
//! 2. **Pairing**: a TLS pairing engine runs the handshake with that key
//! 3. **Finished**: the engine is dropped and only its terminal state kept;
//!    on success the control channel reconnects immediately
//!
//! ## Key Presses
//!
//! Key presses are turned into Key-Down and Key-Up pairs. A press sends
//! Key-Down and arms a short release timer; pressing the same key again only
//! restarts the timer, a different key releases the previous one first.

use crate::companion;
use crate::configuration::DeviceStateSnapshot;
use crate::connection::{ControlChannel, ControlState};
use crate::host::{Handle, HandleKind, HostContext, IoEvent};
use crate::media::{MediaStateChanged, PlaybackState, PlaybackStateChanged};
use crate::messages::KeyAction;
use crate::pairing::{CertificateExtractor, ExtractorOutcome, PairingEngine, PairingState, RsaPublicKey};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Inactivity after which a held key is released
pub const KEY_RELEASE_DELAY: Duration = Duration::from_millis(50);

/// A configured TV
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,

    /// Address of the TV on the local network
    pub ip_address: IpAddr,

    /// Whether the companion app is installed and should be kept in sync
    #[serde(default)]
    pub use_companion_app: bool,
}

/// Pairing sub-connection of a device
#[derive(Debug, Default)]
pub enum PairingSlot {
    /// Pairing never attempted
    #[default]
    Idle,
    /// Fetching the TV certificate
    Extracting(CertificateExtractor),
    /// Running the pairing handshake
    Pairing(PairingEngine),
    /// Last attempt ended in this state
    Finished(PairingState),
}

impl PairingSlot {
    pub fn state(&self) -> Option<PairingState> {
        match self {
            PairingSlot::Idle => None,
            PairingSlot::Extracting(_) => Some(PairingState::Connecting),
            PairingSlot::Pairing(engine) => Some(engine.state()),
            PairingSlot::Finished(state) => Some(*state),
        }
    }
}

#[derive(Debug)]
pub struct Device {
    index: usize,
    config: DeviceConfig,
    pairing_port: u16,
    client_key: RsaPublicKey,
    control: ControlChannel,
    pairing: PairingSlot,
    last_key: Option<u32>,
    key_release_timer: Option<Handle>,
    playback: PlaybackState,
}

impl Device {
    /// Create device `index` (1-based)
    ///
    /// `client_key` is the driver's own public key, used to compute the
    /// pairing proof.
    pub fn new(
        index: usize,
        config: DeviceConfig,
        control_port: u16,
        pairing_port: u16,
        client_key: RsaPublicKey,
    ) -> Self {
        let control = ControlChannel::new(SocketAddr::new(config.ip_address, control_port));
        Self {
            index,
            config,
            pairing_port,
            client_key,
            control,
            pairing: PairingSlot::Idle,
            last_key: None,
            key_release_timer: None,
            playback: PlaybackState::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn control_state(&self) -> ControlState {
        self.control.state()
    }

    pub fn pairing(&self) -> &PairingSlot {
        &self.pairing
    }

    pub fn pairing_state(&self) -> Option<PairingState> {
        self.pairing.state()
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    /// Open the control channel
    pub fn start(&mut self, ctx: &mut HostContext<'_>) {
        info!("Starting device {} ({}) at {}", self.index, self.config.name, self.config.ip_address);
        self.control.connect(ctx);
    }

    /// Route a host event for a handle this device owns
    pub fn dispatch(&mut self, ctx: &mut HostContext<'_>, kind: HandleKind, handle: Handle, event: IoEvent) {
        if kind.is_timer() && event != IoEvent::TimerFired {
            debug!("Ignoring {:?} for timer {} of device {}", event, handle, self.index);
            return;
        }

        let before = self.control.state();

        match kind {
            HandleKind::ControlSocket => self.control.on_socket_event(ctx, handle, event),
            HandleKind::ControlPingTimer
            | HandleKind::ControlReconnectTimer
            | HandleKind::ControlConnectTimer => self.control.on_timer(ctx, kind, handle),
            HandleKind::CertSocket | HandleKind::CertTimer => {
                let PairingSlot::Extracting(extractor) = &mut self.pairing else {
                    debug!("Device {} has no certificate fetch for {}", self.index, handle);
                    return;
                };
                let outcome = if kind == HandleKind::CertTimer {
                    extractor.on_timer(ctx, handle)
                } else {
                    extractor.on_socket_event(ctx, handle, event)
                };
                self.on_extractor_outcome(ctx, outcome);
            }
            HandleKind::PairingSocket | HandleKind::PairingTimer => {
                let PairingSlot::Pairing(engine) = &mut self.pairing else {
                    debug!("Device {} has no pairing engine for {}", self.index, handle);
                    return;
                };
                if kind == HandleKind::PairingTimer {
                    engine.on_timer(ctx, handle);
                } else {
                    engine.on_socket_event(ctx, handle, event);
                }
                self.retire_finished_engine(ctx);
            }
            HandleKind::KeyReleaseTimer => self.on_key_release(ctx, handle),
        }

        if before != ControlState::Configured && self.control.state() == ControlState::Configured {
            self.on_configured(ctx);
        }
    }

    /// Start a new pairing attempt, abandoning any attempt in progress
    pub fn initiate_pairing(&mut self, ctx: &mut HostContext<'_>) {
        self.cancel_pairing(ctx);

        info!("Initiating pairing with device {} ({})", self.index, self.config.name);
        let mut extractor = CertificateExtractor::new(self.pairing_addr());
        extractor.start(ctx);
        self.pairing = PairingSlot::Extracting(extractor);
    }

    /// Forward the code shown on the TV to the pairing engine
    pub fn send_answer(&mut self, ctx: &mut HostContext<'_>, code: &str) -> Result<()> {
        match &mut self.pairing {
            PairingSlot::Pairing(engine) => {
                engine.send_answer(ctx, code)?;
                self.retire_finished_engine(ctx);
                Ok(())
            }
            other => Err(ProtocolError::InvalidState(format!(
                "device {} has no pairing awaiting an answer ({:?})",
                self.index,
                other.state()
            ))),
        }
    }

    /// Press `key_code`, releasing any other held key first
    pub fn send_key(&mut self, ctx: &mut HostContext<'_>, key_code: u32) -> Result<()> {
        match self.last_key {
            Some(last) if last == key_code => {}
            Some(last) => {
                self.control.send_key(ctx, last, KeyAction::Up)?;
                self.last_key = None;
                self.control.send_key(ctx, key_code, KeyAction::Down)?;
            }
            None => self.control.send_key(ctx, key_code, KeyAction::Down)?,
        }
        self.last_key = Some(key_code);

        if let Some(timer) = self.key_release_timer.take() {
            ctx.stop_timer(timer);
        }
        self.key_release_timer = Some(ctx.start_timer(KEY_RELEASE_DELAY, HandleKind::KeyReleaseTimer));
        Ok(())
    }

    /// Launch an app link on the TV
    ///
    /// The package name is only logged; the launch message carries the URI.
    pub fn send_intent(&mut self, ctx: &mut HostContext<'_>, uri: &str, package: Option<&str>) -> Result<()> {
        if let Some(package) = package.filter(|p| !p.is_empty()) {
            debug!("Intent {} for package {} on device {}", uri, package, self.index);
        }
        self.control.send_intent(ctx, uri)
    }

    /// Tell the companion app where the media bridge listens
    pub fn configure_companion_app(
        &mut self,
        ctx: &mut HostContext<'_>,
        host_ip: IpAddr,
        media_port: u16,
    ) -> Result<()> {
        let uri = companion::configure_intent(self.index, host_ip, media_port);
        self.send_intent(ctx, &uri, Some(companion::COMPANION_PACKAGE))
    }

    pub fn install_companion_app(&mut self, ctx: &mut HostContext<'_>) -> Result<()> {
        self.send_intent(ctx, &companion::install_intent(), None)
    }

    pub fn apply_media_state(&mut self, state: &MediaStateChanged) {
        self.playback.apply_media_state(state);
    }

    pub fn apply_playback(&mut self, playback: &PlaybackStateChanged) {
        self.playback.apply_playback(playback);
    }

    /// Extrapolate the playback position; returns whether it moved
    pub fn advance_media_position(&mut self, elapsed: Duration) -> bool {
        self.playback.advance(elapsed)
    }

    pub fn snapshot(&self) -> DeviceStateSnapshot {
        DeviceStateSnapshot {
            index: self.index,
            ip_address: self.config.ip_address.to_string(),
            name: self.config.name.clone(),
            control_state: self.control.state(),
            pairing_state: self
                .pairing_state()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
        }
    }

    /// Release every socket and timer of this device
    pub fn shutdown(&mut self, ctx: &mut HostContext<'_>) {
        self.cancel_pairing(ctx);
        if let Some(timer) = self.key_release_timer.take() {
            ctx.stop_timer(timer);
        }
        self.last_key = None;
        self.control.close(ctx);
    }

    fn pairing_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.ip_address, self.pairing_port)
    }

    fn cancel_pairing(&mut self, ctx: &mut HostContext<'_>) {
        match &mut self.pairing {
            PairingSlot::Extracting(extractor) => extractor.close(ctx),
            PairingSlot::Pairing(engine) => engine.close(ctx),
            PairingSlot::Idle | PairingSlot::Finished(_) => return,
        }
        debug!("Abandoned pairing attempt for device {}", self.index);
        self.pairing = PairingSlot::Idle;
    }

    fn on_extractor_outcome(&mut self, ctx: &mut HostContext<'_>, outcome: ExtractorOutcome) {
        match outcome {
            ExtractorOutcome::Pending => {}
            ExtractorOutcome::Extracted(server_key) => {
                let mut engine =
                    PairingEngine::new(self.pairing_addr(), self.client_key.clone(), server_key);
                engine.start(ctx);
                self.pairing = PairingSlot::Pairing(engine);
            }
            ExtractorOutcome::Failed(e) => {
                if e.is_crypto() {
                    warn!("Device {} presented an unusable certificate: {}", self.index, e);
                } else {
                    warn!("Could not fetch certificate of device {}: {}", self.index, e);
                }
                self.pairing = PairingSlot::Finished(PairingState::Failed);
            }
        }
    }

    fn retire_finished_engine(&mut self, ctx: &mut HostContext<'_>) {
        let state = match &self.pairing {
            PairingSlot::Pairing(engine) if engine.is_terminal() => engine.state(),
            _ => return,
        };
        self.pairing = PairingSlot::Finished(state);

        if state == PairingState::Successful {
            info!("Device {} paired, reconnecting control channel", self.index);
            self.control.reconnect(ctx, Duration::ZERO);
        }
    }

    fn on_key_release(&mut self, ctx: &mut HostContext<'_>, handle: Handle) {
        if self.key_release_timer != Some(handle) {
            return;
        }
        ctx.timer_fired(handle);
        self.key_release_timer = None;

        if let Some(key) = self.last_key.take() {
            match self.control.send_key(ctx, key, KeyAction::Up) {
                Ok(()) => {}
                // the TV drops held keys with the connection
                Err(e) if e.is_recoverable() => {
                    debug!("Key {} on device {} not released: {}", key, self.index, e)
                }
                Err(e) => warn!("Could not release key {} on device {}: {}", key, self.index, e),
            }
        }
    }

    fn on_configured(&mut self, ctx: &mut HostContext<'_>) {
        if !self.config.use_companion_app {
            return;
        }
        if let Err(e) = self.send_intent(ctx, &companion::sync_intent(), Some(companion::COMPANION_PACKAGE)) {
            warn!("Could not sync companion app on device {}: {}", self.index, e);
        }
    }
}
