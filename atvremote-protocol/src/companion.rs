//! Companion app intents
//!
//! The optional companion app forwards now-playing information from the TV
//! to the media bridge. It is driven entirely through app links sent on the
//! control channel.

use std::net::IpAddr;

pub const COMPANION_HOST: &str = "rtiandroidtvcompanion.noesislabs.com";
pub const COMPANION_PACKAGE: &str = "com.noesislabs.rtiandroidtvcompanion";

/// Ask the companion app to resend its current media state
pub fn sync_intent() -> String {
    format!("https://{}/sync", COMPANION_HOST)
}

/// Point the companion app at this driver's media bridge
pub fn configure_intent(device_index: usize, host_ip: IpAddr, media_port: u16) -> String {
    format!(
        "https://{}/config?deviceindex={}&hostip={}&hostport={}",
        COMPANION_HOST, device_index, host_ip, media_port
    )
}

/// Open the store page of the companion app
pub fn install_intent() -> String {
    format!("market://details?id={}", COMPANION_PACKAGE)
}
