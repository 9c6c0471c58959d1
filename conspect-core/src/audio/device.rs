//! Audio device enumeration for the probe's device-list snapshot.

use serde::{Deserialize, Serialize};

/// Metadata about one audio device visible to the OS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub is_input: bool,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Heuristic flag for devices that re-capture system output.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Snapshot every input and output device the host reports.
///
/// Returns an empty `Vec` when enumeration fails or the crate was built
/// without the `audio-cpal` feature.
#[cfg(feature = "audio-cpal")]
pub fn snapshot() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut list = Vec::new();

    if let Ok(devices) = host.input_devices() {
        for (idx, device) in devices.enumerate() {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            list.push(DeviceInfo {
                is_default: default_in.as_deref() == Some(name.as_str()),
                is_loopback_like: is_loopback_like_name(&name),
                is_input: true,
                name,
            });
        }
    }

    if let Ok(devices) = host.output_devices() {
        for (idx, device) in devices.enumerate() {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
            list.push(DeviceInfo {
                is_default: default_out.as_deref() == Some(name.as_str()),
                is_loopback_like: is_loopback_like_name(&name),
                is_input: false,
                name,
            });
        }
    }

    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn snapshot() -> Vec<DeviceInfo> {
    Vec::new()
}
