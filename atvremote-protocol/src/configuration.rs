//! Configuration UI types
//!
//! JSON shapes exchanged with the configuration page: the per-device state
//! snapshot pushed on every change and the requests that drive pairing and
//! companion app setup.

use crate::connection::ControlState;
use serde::{Deserialize, Serialize};

/// State of one device as shown in the configuration UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateSnapshot {
    /// 1-based device index
    pub index: usize,
    pub ip_address: String,
    pub name: String,
    pub control_state: ControlState,
    /// Pairing state name, empty when pairing was never attempted
    pub pairing_state: String,
}

/// Request posted by the configuration UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum ConfigurationRequest {
    InitiatePairing {
        #[serde(rename = "deviceIndex")]
        device_index: usize,
    },
    SendAnswer {
        #[serde(rename = "deviceIndex")]
        device_index: usize,
        answer: String,
    },
    ConfigureCompanionApp {
        #[serde(rename = "deviceIndex")]
        device_index: usize,
    },
    InstallCompanionApp {
        #[serde(rename = "deviceIndex")]
        device_index: usize,
    },
}

impl ConfigurationRequest {
    pub fn device_index(&self) -> usize {
        match self {
            ConfigurationRequest::InitiatePairing { device_index }
            | ConfigurationRequest::SendAnswer { device_index, .. }
            | ConfigurationRequest::ConfigureCompanionApp { device_index }
            | ConfigurationRequest::InstallCompanionApp { device_index } => *device_index,
        }
    }
}
