use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

/// Last-known identity and reachability of one device on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub device_id: String,
    pub domain: String,
    pub address: Ipv4Addr,
    pub display_name: String,
    pub last_seen: SystemTime,
    pub is_local: bool,
    pub is_online: bool,
}

impl Node {
    pub fn new(
        device_id: &str,
        domain: &str,
        address: Ipv4Addr,
        display_name: &str,
        now: SystemTime,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            domain: domain.to_string(),
            address,
            display_name: display_name.to_string(),
            last_seen: now,
            is_local: false,
            is_online: true,
        }
    }

    /// Silence since the last accepted announcement. A clock that stepped
    /// backwards counts as no silence at all.
    pub fn silence(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: SystemTime, offline_timeout: Duration) -> bool {
        self.silence(now) > offline_timeout
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} -> {})", self.display_name, self.domain, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_saturates_on_clock_skew() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let node = Node::new("mac-01", "a.local", Ipv4Addr::LOCALHOST, "a", t0);
        assert_eq!(node.silence(t0 - Duration::from_secs(5)), Duration::ZERO);
        assert_eq!(node.silence(t0 + Duration::from_secs(7)), Duration::from_secs(7));
    }

    #[test]
    fn expiry_is_strictly_after_timeout() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let timeout = Duration::from_secs(30);
        let node = Node::new("mac-01", "a.local", Ipv4Addr::LOCALHOST, "a", t0);
        assert!(!node.is_expired(t0 + timeout, timeout));
        assert!(node.is_expired(t0 + timeout + Duration::from_millis(1), timeout));
    }
}
