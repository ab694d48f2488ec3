use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Largest datagram the receive loop reads. Announcements are small JSON
/// records, anything beyond one Ethernet frame is not ours.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Longest name a resolver accepts.
pub const MAX_DOMAIN_LEN: usize = 253;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Heartbeat,
    // Departure notice, sent once on shutdown
    Offline,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// One multicast datagram: a node's current identity and reachability claim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub action: Action,
    pub domain: String,
    pub ip: Ipv4Addr,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub hostname: String,
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed announcement: {0}")]
    Json(#[from] serde_json::Error),
    #[error("announcement is missing a device id")]
    EmptyDeviceId,
    #[error("announced domain {0:?} is not a valid hostname")]
    InvalidDomain(String),
}

impl Announcement {
    pub fn heartbeat(domain: &str, ip: Ipv4Addr, device_id: &str, hostname: &str) -> Self {
        Self::new(Action::Heartbeat, domain, ip, device_id, hostname)
    }

    pub fn departure(domain: &str, ip: Ipv4Addr, device_id: &str, hostname: &str) -> Self {
        Self::new(Action::Offline, domain, ip, device_id, hostname)
    }

    fn new(action: Action, domain: &str, ip: Ipv4Addr, device_id: &str, hostname: &str) -> Self {
        Self {
            action,
            domain: domain.to_string(),
            ip,
            device_id: device_id.to_string(),
            hostname: hostname.to_string(),
            timestamp: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a received datagram. Unknown fields are ignored; a missing field,
    /// an unknown action or a non-IPv4 `ip` rejects the whole datagram.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(data)?;
        let msg: Announcement = serde_json::from_str(text)?;
        if msg.device_id.is_empty() {
            return Err(DecodeError::EmptyDeviceId);
        }
        if !is_valid_domain(&msg.domain) {
            return Err(DecodeError::InvalidDomain(msg.domain));
        }
        Ok(msg)
    }
}

/// A domain ends up verbatim in the hosts file, so only plain hostnames
/// are accepted: ASCII letters, digits, `-` and `.`.
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= MAX_DOMAIN_LEN
        && domain
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"action":"heartbeat","domain":"dev-1.local","ip":"192.168.1.10","deviceId":"mac-aa:bb:cc:dd:ee:ff","hostname":"dev-1","timestamp":1700000000}"#;

    #[test]
    fn decodes_reference_heartbeat() {
        let msg = Announcement::decode(SAMPLE.as_bytes()).unwrap();
        assert_eq!(msg.action, Action::Heartbeat);
        assert_eq!(msg.domain, "dev-1.local");
        assert_eq!(msg.ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(msg.device_id, "mac-aa:bb:cc:dd:ee:ff");
        assert_eq!(msg.hostname, "dev-1");
        assert_eq!(msg.timestamp, 1_700_000_000);
    }

    #[test]
    fn encodes_wire_field_names() {
        let mut msg =
            Announcement::departure("a.local", Ipv4Addr::new(10, 0, 0, 2), "mac-01", "a");
        msg.timestamp = 42;
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["action"], "offline");
        assert_eq!(value["deviceId"], "mac-01");
        assert_eq!(value["ip"], "10.0.0.2");
        assert_eq!(value["timestamp"], 42);
        assert!(value.get("device_id").is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let data = SAMPLE.replace("\"timestamp\"", "\"version\":\"2\",\"timestamp\"");
        assert!(Announcement::decode(data.as_bytes()).is_ok());
    }

    #[test]
    fn rejects_missing_field() {
        let data = SAMPLE.replace("\"hostname\":\"dev-1\",", "");
        assert!(matches!(
            Announcement::decode(data.as_bytes()),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn rejects_unknown_action_and_bad_ip() {
        let data = SAMPLE.replace("heartbeat", "join");
        assert!(Announcement::decode(data.as_bytes()).is_err());

        let data = SAMPLE.replace("192.168.1.10", "fe80::1");
        assert!(Announcement::decode(data.as_bytes()).is_err());
    }

    #[test]
    fn rejects_garbage_and_empty_id() {
        assert!(matches!(
            Announcement::decode(&[0xff, 0xfe, 0x00]),
            Err(DecodeError::Utf8(_))
        ));
        let data = SAMPLE.replace("mac-aa:bb:cc:dd:ee:ff", "");
        assert!(matches!(
            Announcement::decode(data.as_bytes()),
            Err(DecodeError::EmptyDeviceId)
        ));
    }

    #[test]
    fn rejects_domains_unfit_for_hosts_file() {
        for domain in [
            "",
            "a.local bank.example",
            "x.local\\n6.6.6.6 bank.example",
            "tab\\tname.local",
            "under_score.local",
        ] {
            let data = SAMPLE.replace("dev-1.local", domain);
            assert!(
                matches!(
                    Announcement::decode(data.as_bytes()),
                    Err(DecodeError::InvalidDomain(_))
                ),
                "{domain:?} should be rejected"
            );
        }

        let long = format!("{}.local", "a".repeat(MAX_DOMAIN_LEN));
        let data = SAMPLE.replace("dev-1.local", &long);
        assert!(Announcement::decode(data.as_bytes()).is_err());
    }

    #[test]
    fn hostname_characters_are_valid() {
        assert!(is_valid_domain("dev-1.local"));
        assert!(is_valid_domain("Host.LOCAL-0000ab"));
        assert!(!is_valid_domain("dev 1.local"));
        assert!(!is_valid_domain("dev-1.local\n"));
    }
}
