mod config;
mod configuration_server;
mod host;
mod media_server;
mod tls;

use anyhow::{Context, Result};
use atvremote_protocol::media::{CoverArtCache, MEDIA_TICK};
use atvremote_protocol::{CertificateInfo, DeviceEvent, DeviceRegistry, IoEvent};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use config::Config;
use host::TokioHost;

/// Android TV Remote daemon
#[derive(Debug, Parser)]
#[command(name = "atvremote-daemon", version, about)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every frame in hex
    #[arg(long)]
    trace: bool,
}

/// Main daemon state
struct Daemon {
    /// Configuration
    config: Config,

    /// Identity presented to the TVs
    identity: CertificateInfo,
}

impl Daemon {
    /// Create a new daemon
    fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let identity = Self::load_or_generate_certificate(&config)
            .context("Failed to load certificate")?;
        info!("Identity fingerprint: {}", identity.fingerprint);

        Ok(Self { config, identity })
    }

    /// Load or generate the driver certificate
    fn load_or_generate_certificate(config: &Config) -> Result<CertificateInfo> {
        let cert_path = config.certificate_path();
        let key_path = config.private_key_path();

        if cert_path.exists() && key_path.exists() {
            info!("Loading existing certificate from {:?}", cert_path);
            CertificateInfo::load_from_files(&cert_path, &key_path)
                .context("Failed to load certificate")
        } else {
            info!("Generating new driver certificate");
            let cert = CertificateInfo::generate("atvremote")
                .context("Failed to generate certificate")?;

            cert.save_to_files(&cert_path, &key_path)
                .context("Failed to save certificate")?;

            Ok(cert)
        }
    }

    /// Run the dispatch loop until Ctrl+C
    async fn run(self) -> Result<()> {
        let connector = tls::create_connector(&self.identity)?;
        let (mut host, mut io_events) = TokioHost::new(connector);

        let client_key = self
            .identity
            .public_key()
            .context("Failed to read identity public key")?;
        let (mut registry, mut device_events) = DeviceRegistry::new(
            self.config.registry_config(),
            self.config.devices.clone(),
            client_key,
        )
        .context("Failed to create device registry")?;

        let (snapshot, snapshot_receiver) = watch::channel(registry.snapshot());
        let cover_art = Arc::new(RwLock::new(CoverArtCache::new()));
        let (media_sender, mut media_messages) = mpsc::unbounded_channel();
        let (request_sender, mut requests) = mpsc::unbounded_channel();

        let media_port = self.config.network.media_port;
        tokio::spawn(async move {
            if let Err(e) = media_server::run(media_port, cover_art, media_sender).await {
                error!("Media bridge stopped: {:#}", e);
            }
        });

        if self.config.network.enable_configuration {
            let port = self.config.network.configuration_port;
            tokio::spawn(async move {
                if let Err(e) = configuration_server::run(port, snapshot_receiver, request_sender).await {
                    error!("Configuration endpoint stopped: {:#}", e);
                }
            });
        }

        registry.start(&mut host);
        info!("Daemon running with {} devices", registry.len());
        info!("Press Ctrl+C to stop");

        let mut ticker = tokio::time::interval(MEDIA_TICK);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some((handle, event)) = io_events.recv() => {
                    if event == IoEvent::TimerFired {
                        host.timer_expired(handle);
                    }
                    registry.handle_io(&mut host, handle, event);
                }
                Some((request, reply)) = requests.recv() => {
                    let outcome = registry.apply_request(&mut host, request);
                    if reply.send(outcome).is_err() {
                        debug!("Configuration client gone, dropping request outcome");
                    }
                }
                Some(message) = media_messages.recv() => {
                    if let Err(e) = registry.apply_media(message) {
                        warn!("Discarding media message: {}", e);
                    }
                }
                _ = ticker.tick() => registry.advance_media_position(MEDIA_TICK),
                Some(event) = device_events.recv() => {
                    log_device_event(&event);
                    if matches!(event, DeviceEvent::StateChanged { .. }) {
                        snapshot.send_replace(registry.snapshot());
                    }
                }
                result = &mut shutdown => {
                    result.context("Failed to listen for shutdown signal")?;
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        registry.shutdown(&mut host);
        debug!(
            "{} sockets and {} timers left at exit",
            host.live_sockets(),
            host.live_timers()
        );
        info!("Daemon shutdown complete");
        Ok(())
    }
}

fn log_device_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::StateChanged {
            index,
            control_state,
            pairing_state,
        } => info!(
            "Device {}: control {}, pairing {}",
            index,
            control_state,
            pairing_state.map(|s| s.as_str()).unwrap_or("-")
        ),
        DeviceEvent::MediaMetadataChanged { index, now_playing } => info!(
            "Device {} playing {:?} by {:?} in {}",
            index, now_playing.title, now_playing.artist, now_playing.app_name
        ),
        DeviceEvent::PlaybackChanged { .. } => debug!("{:?}", event),
        DeviceEvent::MediaError { index, message } => warn!("Device {} media error: {}", index, message),
    }
}

fn init_logging(trace: bool) {
    let default_filter = if trace { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    init_logging(args.trace || config.logging.trace);
    info!("Starting Android TV Remote daemon...");
    info!("Configuration loaded from {}", config_path.display());

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    let daemon = Daemon::new(config).context("Failed to create daemon")?;
    daemon.run().await
}
