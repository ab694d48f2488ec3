//! Managed block in the system hosts file.
//!
//! Only lines between the begin and end markers are ever touched; every
//! write is preceded by a copy of the previous file at `<path>.bak`.

use crate::membership::ChangeListener;
use crate::node::Node;
use crate::protocol::is_valid_domain;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const BEGIN_MARKER: &str = "# === LanLink Managed Begin ===";
pub const END_MARKER: &str = "# === LanLink Managed End ===";
pub const ENTRY_MARKER: &str = "# LanLink";

#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("no permission to modify {path}, run as administrator/root: {source}")]
    Permission {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("hosts file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("refusing to write {0:?}, not a valid hostname")]
    InvalidDomain(String),
}

pub struct HostsFile {
    path: PathBuf,
    // device id -> domain last written for it, so a renamed device does not
    // leave its old entry behind
    published: Mutex<HashMap<String, String>>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            published: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self) -> impl Fn(std::io::Error) -> HostsError + '_ {
        move |source| HostsError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn check_permission(&self) -> Result<(), HostsError> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map(drop)
            .map_err(|source| HostsError::Permission {
                path: self.path.clone(),
                source,
            })
    }

    fn read(&self) -> Result<String, HostsError> {
        std::fs::read_to_string(&self.path).map_err(self.io_err())
    }

    /// Write `updated` if it differs from `current`, backing up first.
    fn write_if_changed(&self, current: &str, updated: String) -> Result<bool, HostsError> {
        if current == updated {
            return Ok(false);
        }
        let mut backup = self.path.clone().into_os_string();
        backup.push(".bak");
        std::fs::write(&backup, current).map_err(self.io_err())?;
        std::fs::write(&self.path, updated).map_err(self.io_err())?;
        Ok(true)
    }

    /// Append the managed block once.
    pub fn initialize(&self) -> Result<(), HostsError> {
        let current = self.read()?;
        self.write_if_changed(&current, ensure_block(&current))?;
        Ok(())
    }

    /// Ensure `domain` maps to `ip`. Returns whether the file changed.
    pub fn add_or_update(&self, ip: Ipv4Addr, domain: &str) -> Result<bool, HostsError> {
        if !is_valid_domain(domain) {
            return Err(HostsError::InvalidDomain(domain.to_string()));
        }
        let current = self.read()?;
        self.write_if_changed(&current, apply_upsert(&current, ip, domain))
    }

    /// Ensure no managed entry for `domain` exists. Returns whether the file
    /// changed.
    pub fn remove(&self, domain: &str) -> Result<bool, HostsError> {
        let current = self.read()?;
        self.write_if_changed(&current, apply_remove(&current, domain))
    }

    /// Drop every managed entry, keeping the markers.
    pub fn clear(&self) -> Result<bool, HostsError> {
        let current = self.read()?;
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.write_if_changed(&current, apply_clear(&current))
    }

    /// Managed entries as domain -> ip.
    pub fn list(&self) -> Result<BTreeMap<String, String>, HostsError> {
        Ok(parse_entries(&self.read()?))
    }
}

impl ChangeListener for HostsFile {
    fn on_change(&self, node: &Node, is_online: bool) {
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);

        if !is_online {
            published.remove(&node.device_id);
            match self.remove(&node.domain) {
                Ok(_) => tracing::info!(domain = %node.domain, "removed hosts entry"),
                Err(e) => {
                    tracing::error!(
                        domain = %node.domain,
                        error = %e,
                        "failed to remove hosts entry"
                    )
                }
            }
            return;
        }

        if let Some(old) = published.get(&node.device_id).filter(|d| **d != node.domain) {
            if let Err(e) = self.remove(old) {
                tracing::error!(domain = %old, error = %e, "failed to remove stale hosts entry");
            }
        }
        match self.add_or_update(node.address, &node.domain) {
            Ok(_) => {
                tracing::info!(domain = %node.domain, ip = %node.address, "updated hosts entry");
                published.insert(node.device_id.clone(), node.domain.clone());
            }
            Err(e) => {
                tracing::error!(domain = %node.domain, error = %e, "failed to update hosts entry")
            }
        }
    }
}

fn entry_line(ip: Ipv4Addr, domain: &str) -> String {
    format!("{ip}\t{domain}\t{ENTRY_MARKER}")
}

/// `Some(domain)` when `line` is a managed entry.
fn entry_domain(line: &str) -> Option<&str> {
    if !line.contains(ENTRY_MARKER) {
        return None;
    }
    line.split_whitespace().nth(1)
}

fn has_block(content: &str) -> bool {
    let mut lines = content.lines().map(str::trim);
    lines.any(|l| l == BEGIN_MARKER) && lines.any(|l| l == END_MARKER)
}

pub fn ensure_block(content: &str) -> String {
    if has_block(content) {
        return content.to_string();
    }
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("\n{BEGIN_MARKER}\n{END_MARKER}\n"));
    out
}

/// Rewrite the managed block: keep entries `keep` accepts, then append
/// `extra` just before the end marker.
fn rewrite_block<F>(content: &str, keep: F, extra: Option<String>) -> String
where
    F: Fn(&str) -> bool,
{
    let content = ensure_block(content);
    let mut out = Vec::new();
    let mut in_block = false;
    let mut extra = extra;

    for line in content.lines() {
        match line.trim() {
            BEGIN_MARKER => in_block = true,
            END_MARKER if in_block => {
                in_block = false;
                out.extend(extra.take());
            }
            _ if in_block && !keep(line) => continue,
            _ => {}
        }
        out.push(line.to_string());
    }

    let mut text = out.join("\n");
    if content.ends_with('\n') {
        text.push('\n');
    }
    text
}

pub fn apply_upsert(content: &str, ip: Ipv4Addr, domain: &str) -> String {
    let wanted = entry_line(ip, domain);
    let present = managed_lines(content).any(|l| l == wanted);
    if present && managed_lines(content).filter(|l| entry_domain(l) == Some(domain)).count() == 1 {
        return ensure_block(content);
    }
    rewrite_block(content, |l| entry_domain(l) != Some(domain), Some(wanted))
}

pub fn apply_remove(content: &str, domain: &str) -> String {
    rewrite_block(content, |l| entry_domain(l) != Some(domain), None)
}

pub fn apply_clear(content: &str) -> String {
    rewrite_block(content, |l| entry_domain(l).is_none(), None)
}

fn managed_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .skip_while(|l| l.trim() != BEGIN_MARKER)
        .skip(1)
        .take_while(|l| l.trim() != END_MARKER)
}

pub fn parse_entries(content: &str) -> BTreeMap<String, String> {
    managed_lines(content)
        .filter_map(|line| {
            let domain = entry_domain(line)?;
            let ip = line.split_whitespace().next()?;
            Some((domain.to_string(), ip.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    const BASE: &str = "127.0.0.1\tlocalhost\n::1\tlocalhost\n";
    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    #[test]
    fn block_is_appended_once() {
        let once = ensure_block(BASE);
        assert!(once.starts_with(BASE));
        assert!(once.contains(BEGIN_MARKER) && once.contains(END_MARKER));
        assert_eq!(ensure_block(&once), once);
        assert!(ensure_block("127.0.0.1 localhost").contains("localhost\n\n# ==="));
    }

    #[test]
    fn upsert_is_idempotent_and_replaces_ip() {
        let one = apply_upsert(BASE, IP, "dev-1.local");
        assert_eq!(apply_upsert(&one, IP, "dev-1.local"), one);
        assert_eq!(parse_entries(&one).get("dev-1.local").unwrap(), "192.168.1.10");

        let moved = apply_upsert(&one, Ipv4Addr::new(192, 168, 1, 99), "dev-1.local");
        let entries = parse_entries(&moved);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["dev-1.local"], "192.168.1.99");
        assert!(moved.starts_with(BASE));
    }

    #[test]
    fn remove_only_touches_managed_block() {
        let content = format!("{BASE}10.0.0.1\tdev-1.local\t{ENTRY_MARKER}\n");
        let content = apply_upsert(&content, IP, "dev-1.local");
        let content = apply_upsert(&content, IP, "dev-2.local");

        let removed = apply_remove(&content, "dev-1.local");
        assert!(removed.contains(&format!("10.0.0.1\tdev-1.local\t{ENTRY_MARKER}")));
        let entries = parse_entries(&removed);
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["dev-2.local"]);
        assert_eq!(apply_remove(&removed, "dev-1.local"), removed);
    }

    #[test]
    fn clear_keeps_markers() {
        let content = apply_upsert(BASE, IP, "dev-1.local");
        let cleared = apply_clear(&content);
        assert!(parse_entries(&cleared).is_empty());
        assert!(cleared.contains(BEGIN_MARKER));
        assert!(cleared.starts_with(BASE));
    }

    #[test]
    fn file_operations_back_up_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, BASE).unwrap();

        let hosts = HostsFile::new(&path);
        hosts.check_permission().unwrap();
        hosts.initialize().unwrap();
        assert!(hosts.add_or_update(IP, "dev-1.local").unwrap());
        assert!(!hosts.add_or_update(IP, "dev-1.local").unwrap());

        let backup = std::fs::read_to_string(dir.path().join("hosts.bak")).unwrap();
        assert!(backup.contains(BEGIN_MARKER));
        assert!(!backup.contains("dev-1.local"));

        assert_eq!(hosts.list().unwrap()["dev-1.local"], "192.168.1.10");
        assert!(hosts.remove("dev-1.local").unwrap());
        assert!(hosts.list().unwrap().is_empty());
    }

    #[test]
    fn missing_file_fails_permission_check() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = HostsFile::new(dir.path().join("nope"));
        assert!(matches!(
            hosts.check_permission(),
            Err(HostsError::Permission { .. })
        ));
    }

    #[test]
    fn listener_follows_renames_and_departures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, BASE).unwrap();
        let hosts = HostsFile::new(&path);

        let mut node = Node::new("mac-a", "a.local", IP, "a", SystemTime::now());
        hosts.on_change(&node, true);
        node.domain = "a2.local".into();
        hosts.on_change(&node, true);
        let entries = hosts.list().unwrap();
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["a2.local"]);

        hosts.on_change(&node, false);
        assert!(hosts.list().unwrap().is_empty());
    }

    #[test]
    fn unsafe_domains_never_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, BASE).unwrap();
        let hosts = HostsFile::new(&path);
        hosts.initialize().unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        for domain in [
            "a.local bank.example",
            "x.local\n# === LanLink Managed End ===\n6.6.6.6 bank.example",
        ] {
            assert!(matches!(
                hosts.add_or_update(IP, domain),
                Err(HostsError::InvalidDomain(_))
            ));
            let node = Node::new("mac-x", domain, IP, "x", SystemTime::now());
            hosts.on_change(&node, true);
            hosts.on_change(&node, false);
        }
        hosts.clear().unwrap();

        let after = std::fs::read_to_string(&path).unwrap();
        assert_eq!(after, before);
        assert!(!after.contains("bank.example"));
        assert_eq!(after.matches(END_MARKER).count(), 1);
    }
}
