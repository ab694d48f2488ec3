//! Where the local device id and display name come from.

use crate::config::Config;
use std::path::{Path, PathBuf};

/// Generated device ids are kept in this file next to the config.
pub const DEVICE_ID_FILE: &str = "device_id";

const SERIAL_SUFFIX_LEN: usize = 6;
const FALLBACK_NAME: &str = "lanlink-node";

// Placeholder values firmware vendors leave in DMI fields.
const INVALID_SERIALS: [&str; 8] = [
    "To Be Filled By O.E.M.",
    "Default string",
    "None",
    "N/A",
    "Not Specified",
    "System Serial Number",
    "0",
    "",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(device_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Resolve the identity for this machine, honouring config overrides.
    /// A generated id is stored in `id_file` and reused on later starts.
    pub fn resolve(config: &Config, id_file: &Path) -> Self {
        Self {
            device_id: resolve_device_id(config.device_id.as_deref(), id_file),
            display_name: resolve_display_name(&config.device_name),
        }
    }
}

/// `DEVICE_ID_FILE` in the directory holding `config_path`.
pub fn device_id_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(DEVICE_ID_FILE)
}

/// Device id precedence: explicit override, first hardware MAC,
/// machine-id, then an id generated once and stored in `id_file`.
pub fn resolve_device_id(override_id: Option<&str>, id_file: &Path) -> String {
    if let Some(id) = override_id.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    if let Some(mac) = first_mac_address(Path::new("/sys/class/net")) {
        return format!("mac-{mac}");
    }
    if let Some(machine_id) = machine_id() {
        return format!("id-{machine_id}");
    }
    stored_device_id(id_file)
}

fn stored_device_id(id_file: &Path) -> String {
    if let Some(id) = read_trimmed(id_file) {
        tracing::debug!(%id, path = %id_file.display(), "loaded device id");
        return id;
    }

    let id = format!("uuid-{}", uuid::Uuid::new_v4());
    match save_device_id(id_file, &id) {
        Ok(()) => tracing::info!(%id, path = %id_file.display(), "generated new device id"),
        Err(e) => tracing::warn!(
            %id,
            path = %id_file.display(),
            error = %e,
            "could not store device id, it will change on the next start"
        ),
    }
    id
}

fn save_device_id(id_file: &Path, id: &str) -> std::io::Result<()> {
    if let Some(parent) = id_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(id_file, format!("{id}\n"))
}

pub fn resolve_display_name(configured: &str) -> String {
    let configured = configured.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    if let Some(serial) = hardware_serial() {
        return format!("{}-{}", platform(), host_id(&serial));
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

pub fn platform() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win",
        "macos" => "macos",
        "linux" => "linux",
        _ => "unknown",
    }
}

/// Last six lowercase alphanumerics of a serial, left padded with zeros.
pub fn host_id(serial: &str) -> String {
    let clean: String = serial
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let tail = &clean[clean.len().saturating_sub(SERIAL_SUFFIX_LEN)..];
    format!("{:0>width$}", tail, width = SERIAL_SUFFIX_LEN)
}

/// First non-loopback, non-zero MAC under a sysfs style `net` directory,
/// in interface name order.
fn first_mac_address(net_dir: &Path) -> Option<String> {
    let mut entries: Vec<_> = std::fs::read_dir(net_dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    entries.sort();

    entries.into_iter().find_map(|iface| {
        if iface.file_name().is_some_and(|n| n == "lo") {
            return None;
        }
        let mac = read_trimmed(&iface.join("address"))?.to_lowercase();
        let is_zero = mac.split(':').all(|octet| octet == "00");
        (mac.len() == 17 && !is_zero).then_some(mac)
    })
}

fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|p| read_trimmed(Path::new(p)))
}

fn hardware_serial() -> Option<String> {
    let dmi = [
        "/sys/class/dmi/id/product_serial",
        "/sys/class/dmi/id/board_serial",
    ]
    .iter()
    .find_map(|p| read_trimmed(Path::new(p)).filter(|s| is_valid_serial(s)));
    dmi.or_else(machine_id)
}

fn is_valid_serial(serial: &str) -> bool {
    !INVALID_SERIALS.iter().any(|bad| serial.eq_ignore_ascii_case(bad))
}

fn read_trimmed(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
