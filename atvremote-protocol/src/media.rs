//! Media Bridge
//!
//! A companion app on the TV reports now-playing information over plain TCP.
//! Each connection carries one frame:
//!
//! ```text
//! length (u32, little endian) | base64 text of `length` bytes
//! ```
//!
//! The decoded text is JSON of the form
//! `{"DeviceIndex": 1, "PayloadType": "...", "Payload": {...}}`.
//!
//! The same listener answers `GET /coverart?deviceIndex=NN` with the album
//! art last reported for that device.

use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Interval of the local position extrapolation ticker
pub const MEDIA_TICK: Duration = Duration::from_millis(250);

/// Android `PlaybackState.STATE_PLAYING`
pub const STATE_PLAYING: i32 = 3;

/// Frames larger than this are rejected
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MediaMetadata {
    pub album: Option<String>,
    pub album_art: Option<String>,
    pub album_art_uri: Option<String>,
    pub artist: Option<String>,
    pub duration: Option<i64>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MediaStateChanged {
    pub app_name: Option<String>,
    pub metadata: Option<MediaMetadata>,
    pub package_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PlaybackDetails {
    pub state: i32,
    pub position: i64,
    pub playback_speed: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PlaybackStateChanged {
    pub playback_state: Option<PlaybackDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceError {
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaPayload {
    MediaStateChanged(MediaStateChanged),
    PlaybackStateChanged(PlaybackStateChanged),
    ServiceErrorEncountered(ServiceError),
}

/// A decoded media bridge message
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMessage {
    pub device_index: usize,
    pub payload: MediaPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMediaMessage {
    device_index: usize,
    payload_type: String,
    #[serde(default)]
    payload: Value,
}

fn payload_or_default<T: DeserializeOwned + Default>(value: Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value)?)
}

impl MediaMessage {
    /// Parse the JSON text carried by a frame
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawMediaMessage = serde_json::from_str(text)?;
        let payload = match raw.payload_type.as_str() {
            "MediaStateChanged" => MediaPayload::MediaStateChanged(payload_or_default(raw.payload)?),
            "PlaybackStateChanged" => {
                MediaPayload::PlaybackStateChanged(payload_or_default(raw.payload)?)
            }
            "ServiceErrorEncountered" => {
                MediaPayload::ServiceErrorEncountered(payload_or_default(raw.payload)?)
            }
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "Unrecognized media payload type {:?}",
                    other
                )));
            }
        };

        Ok(Self {
            device_index: raw.device_index,
            payload,
        })
    }
}

/// Accumulates one media bridge frame
#[derive(Debug, Default)]
pub struct MediaFrameDecoder {
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl MediaFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the message once the whole frame has arrived
    pub fn push(&mut self, data: &[u8]) -> Result<Option<MediaMessage>> {
        self.buffer.extend_from_slice(data);

        let expected = match self.expected {
            Some(expected) => expected,
            None => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                let mut prefix = [0u8; 4];
                prefix.copy_from_slice(&self.buffer[..4]);
                let expected = u32::from_le_bytes(prefix) as usize;
                if expected > MAX_FRAME_LEN {
                    return Err(ProtocolError::FrameTooLarge(expected));
                }
                self.buffer.drain(..4);
                self.expected = Some(expected);
                expected
            }
        };

        if self.buffer.len() < expected {
            trace!("Media frame {}/{} bytes", self.buffer.len(), expected);
            return Ok(None);
        }

        let text = STANDARD.decode(&self.buffer[..expected])?;
        self.buffer.clear();
        self.expected = None;

        let text = String::from_utf8(text)
            .map_err(|e| ProtocolError::InvalidMessage(format!("Media frame is not UTF-8: {}", e)))?;
        MediaMessage::from_json(&text).map(Some)
    }
}

/// Locally extrapolated playback position of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackState {
    pub duration_ms: i64,
    pub position_ms: i64,
    pub is_playing: bool,
}

impl PlaybackState {
    pub fn apply_media_state(&mut self, state: &MediaStateChanged) {
        self.duration_ms = state
            .metadata
            .as_ref()
            .and_then(|m| m.duration)
            .unwrap_or(0);
    }

    pub fn apply_playback(&mut self, playback: &PlaybackStateChanged) {
        let details = playback.playback_state.as_ref();
        self.is_playing = details.map(|d| d.state) == Some(STATE_PLAYING);
        self.position_ms = details.map(|d| d.position).unwrap_or(0);
    }

    /// Advance a playing position by `elapsed`; returns whether it moved
    ///
    /// The position is clamped to the duration when one is known.
    pub fn advance(&mut self, elapsed: Duration) -> bool {
        if !self.is_playing {
            return false;
        }
        let elapsed_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        let next = self.position_ms.saturating_add(elapsed_ms);
        self.position_ms = if self.duration_ms < 1 {
            next
        } else {
            next.min(self.duration_ms)
        };
        true
    }

    /// Rounded-up percentage of the duration played, 0 without a duration
    pub fn progress_percent(&self) -> u32 {
        if self.duration_ms == 0 {
            return 0;
        }
        let ratio = self.position_ms as f64 / self.duration_ms as f64;
        (ratio * 100.0).ceil().max(0.0) as u32
    }

    pub fn elapsed_text(&self) -> String {
        format_media_time(self.position_ms)
    }
}

/// Format milliseconds as `HH:MM:SS`, hours wrapping at 24
pub fn format_media_time(ms: i64) -> String {
    let total_seconds = ms.max(0) / 1000;
    let seconds = total_seconds % 60;
    let minutes = (total_seconds / 60) % 60;
    let hours = (total_seconds / 3600) % 24;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Last album art reported per device
#[derive(Debug, Default)]
pub struct CoverArtCache {
    images: HashMap<usize, Vec<u8>>,
}

impl CoverArtCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a device's art with the base64 `AlbumArt` of a media update
    pub fn update(&mut self, device_index: usize, state: &MediaStateChanged) -> Result<()> {
        self.images.remove(&device_index);

        let album_art = state
            .metadata
            .as_ref()
            .and_then(|m| m.album_art.as_deref())
            .filter(|art| !art.is_empty());

        if let Some(album_art) = album_art {
            let image = STANDARD.decode(album_art)?;
            debug!("Cached {} byte cover art for device {}", image.len(), device_index);
            self.images.insert(device_index, image);
        }
        Ok(())
    }

    pub fn get(&self, device_index: usize) -> Option<&[u8]> {
        self.images.get(&device_index).map(Vec::as_slice)
    }
}

/// Device index of a `GET /coverart?deviceIndex=NN` request
pub fn parse_cover_art_request(request: &[u8]) -> Option<usize> {
    const KEY: &[u8] = b"deviceIndex=";

    if !request.starts_with(b"GET") {
        return None;
    }
    let start = request
        .windows(KEY.len())
        .rposition(|w| w == KEY)?
        + KEY.len();

    let digits: String = request[start..]
        .iter()
        .take(2)
        .take_while(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
    digits.parse().ok()
}

/// Full HTTP response for a cover art request
pub fn cover_art_response(device_index: usize, image: Option<&[u8]>) -> Vec<u8> {
    match image {
        Some(image) => {
            let mut response = format!(
                "HTTP/1.0 200 OK\r\n\
                 Server: HTTP Server\r\n\
                 Cache-Control: no-cache, no-store, must-revalidate\r\n\
                 Pragma: no-cache\r\n\
                 Expires: 0\r\n\
                 Content-type: image/jpeg; charset=UTF-8\r\n\
                 Content-Length: {}\r\n\r\n",
                image.len()
            )
            .into_bytes();
            response.extend_from_slice(image);
            response
        }
        None => {
            let body = format!(
                "<!DOCTYPE html><html><body>Could not find cover art for device with index [{}]</body></html>\r\n",
                device_index
            );
            format!(
                "HTTP/1.0 400 Bad Request\r\n\
                 Server: HTTP Server\r\n\
                 Content-type: text/html; charset=UTF-8\r\n\
                 Content-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_bytes()
        }
    }
}

/// URL under which a device's cached cover art is served
pub fn cover_art_url(host: &str, port: u16, device_index: usize, cache_buster: u64) -> String {
    format!(
        "http://{}:{}/coverart?deviceIndex={:02}&cb={}",
        host, port, device_index, cache_buster
    )
}
