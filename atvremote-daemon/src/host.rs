//! Tokio host
//!
//! Implements the protocol's [`Host`] capability on tokio. Every socket runs
//! in its own task and receives commands over a channel; every timer is a
//! sleeping task. Completions are reported as `(Handle, IoEvent)` pairs on a
//! single channel that the dispatch loop feeds back into the registry.

use crate::tls;
use atvremote_protocol::{Handle, Host, IoEvent, SocketMode};
use openssl::ssl::SslConnector;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_openssl::SslStream;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 8192;

pub type HostEvent = (Handle, IoEvent);

#[derive(Debug)]
enum SocketCommand {
    StartTls,
    Write(Vec<u8>),
    Close,
}

enum Stream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
    Upgrading,
}

impl Stream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf).await,
            Stream::Tls(s) => s.read(buf).await,
            Stream::Upgrading => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.write_all(data).await,
            Stream::Tls(s) => s.write_all(data).await,
            Stream::Upgrading => Err(io::Error::new(io::ErrorKind::NotConnected, "TLS upgrade in progress")),
        }
    }

    async fn shutdown(&mut self) {
        let result = match self {
            Stream::Plain(s) => s.shutdown().await,
            Stream::Tls(s) => s.shutdown().await,
            Stream::Upgrading => Ok(()),
        };
        if let Err(e) = result {
            trace!("Socket shutdown: {}", e);
        }
    }
}

pub struct TokioHost {
    next: u32,
    connector: Arc<SslConnector>,
    events: mpsc::UnboundedSender<HostEvent>,
    sockets: HashMap<Handle, mpsc::UnboundedSender<SocketCommand>>,
    timers: HashMap<Handle, JoinHandle<()>>,
}

impl TokioHost {
    pub fn new(connector: Arc<SslConnector>) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                next: 0,
                connector,
                events,
                sockets: HashMap::new(),
                timers: HashMap::new(),
            },
            receiver,
        )
    }

    /// Forget a timer whose `TimerFired` event is being delivered
    pub fn timer_expired(&mut self, timer: Handle) {
        self.timers.remove(&timer);
    }

    pub fn live_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn live_timers(&self) -> usize {
        self.timers.len()
    }

    fn allocate(&mut self) -> Handle {
        self.next = self.next.wrapping_add(1);
        Handle(self.next)
    }

    fn command(&self, socket: Handle, command: SocketCommand) {
        match self.sockets.get(&socket) {
            Some(sender) => {
                if sender.send(command).is_err() {
                    trace!("Socket {} task already finished", socket);
                }
            }
            None => warn!("{:?} for unknown socket {}", command, socket),
        }
    }
}

impl Host for TokioHost {
    fn open_socket(&mut self, addr: SocketAddr, mode: SocketMode) -> Handle {
        let handle = self.allocate();
        let (commands, receiver) = mpsc::unbounded_channel();
        self.sockets.insert(handle, commands);

        debug!("Opening {:?} socket {} to {}", mode, handle, addr);
        tokio::spawn(run_socket(
            handle,
            addr,
            self.connector.clone(),
            receiver,
            self.events.clone(),
        ));
        handle
    }

    fn start_tls(&mut self, socket: Handle) {
        self.command(socket, SocketCommand::StartTls);
    }

    fn write(&mut self, socket: Handle, data: &[u8]) {
        self.command(socket, SocketCommand::Write(data.to_vec()));
    }

    fn close_socket(&mut self, socket: Handle) {
        self.command(socket, SocketCommand::Close);
        self.sockets.remove(&socket);
    }

    fn start_timer(&mut self, delay: Duration) -> Handle {
        let handle = self.allocate();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send((handle, IoEvent::TimerFired));
        });
        self.timers.insert(handle, task);
        handle
    }

    fn stop_timer(&mut self, timer: Handle) {
        if let Some(task) = self.timers.remove(&timer) {
            task.abort();
        }
    }
}

async fn run_socket(
    handle: Handle,
    addr: SocketAddr,
    connector: Arc<SslConnector>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let emit = |event: IoEvent| {
        let _ = events.send((handle, event));
    };

    let tcp = match TcpStream::connect(addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            debug!("Connecting socket {} to {} failed: {}", handle, addr, e);
            emit(IoEvent::Disconnected);
            return;
        }
    };
    emit(IoEvent::Connected);

    let mut stream = Stream::Plain(tcp);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::StartTls) => {
                    match std::mem::replace(&mut stream, Stream::Upgrading) {
                        Stream::Plain(tcp) => match tls::handshake(&connector, tcp).await {
                            Ok(tls) => {
                                stream = Stream::Tls(tls);
                                emit(IoEvent::TlsEstablished);
                            }
                            Err(e) => {
                                debug!("Socket {} to {}: {:#}", handle, addr, e);
                                emit(IoEvent::TlsFailed);
                                return;
                            }
                        },
                        other => {
                            warn!("Socket {} is already using TLS", handle);
                            stream = other;
                        }
                    }
                }
                Some(SocketCommand::Write(data)) => {
                    if let Err(e) = stream.write_all(&data).await {
                        debug!("Write to socket {} failed: {}", handle, e);
                        emit(IoEvent::Disconnected);
                        return;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    stream.shutdown().await;
                    return;
                }
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    emit(IoEvent::Disconnected);
                    return;
                }
                Ok(n) => emit(IoEvent::Data(buf[..n].to_vec())),
                Err(e) => {
                    debug!("Read from socket {} failed: {}", handle, e);
                    emit(IoEvent::Disconnected);
                    return;
                }
            },
        }
    }
}
