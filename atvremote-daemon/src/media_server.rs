//! Media bridge listener
//!
//! Accepts one frame per connection from the companion app and forwards the
//! decoded message to the dispatch loop. A connection that starts with
//! `GET /coverart?deviceIndex=NN` is answered with the cached album art.

use anyhow::{Context, Result};
use atvremote_protocol::media::{
    cover_art_response, parse_cover_art_request, CoverArtCache, MediaFrameDecoder, MediaMessage,
    MediaPayload,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

pub type SharedCoverArt = Arc<RwLock<CoverArtCache>>;

/// Listen on `port` until the listener fails
pub async fn run(
    port: u16,
    cover_art: SharedCoverArt,
    messages: mpsc::UnboundedSender<MediaMessage>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind media bridge port {}", port))?;
    info!("Media bridge listening on port {}", port);

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("Media bridge accept failed")?;
        let cover_art = cover_art.clone();
        let messages = messages.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, cover_art, messages).await {
                warn!("Media bridge connection from {}: {:#}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    cover_art: SharedCoverArt,
    messages: mpsc::UnboundedSender<MediaMessage>,
) -> Result<()> {
    let mut decoder = MediaFrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    let mut first = true;

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("Media bridge connection from {} closed before a full frame", peer);
            return Ok(());
        }
        let data = &buf[..n];

        if first {
            first = false;
            if data.starts_with(b"GET") {
                return serve_cover_art(&mut stream, data, &cover_art).await;
            }
        }

        let Some(message) = decoder.push(data)? else {
            continue;
        };
        trace!("Media message from {}: {:?}", peer, message);

        if let MediaPayload::MediaStateChanged(state) = &message.payload {
            if let Err(e) = cover_art.write().await.update(message.device_index, state) {
                warn!("Discarding album art for device {}: {}", message.device_index, e);
            }
        }

        if messages.send(message).is_err() {
            debug!("Dispatch loop gone, dropping media message");
        }
        return Ok(());
    }
}

async fn serve_cover_art(stream: &mut TcpStream, request: &[u8], cover_art: &SharedCoverArt) -> Result<()> {
    let Some(index) = parse_cover_art_request(request) else {
        debug!("Ignoring request {:?}", String::from_utf8_lossy(request).lines().next());
        return Ok(());
    };

    let response = {
        let cache = cover_art.read().await;
        cover_art_response(index, cache.get(index))
    };
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}
