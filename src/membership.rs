use crate::node::Node;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

/// Receives every online/offline transition of a non-local node.
///
/// Called synchronously while the table's write lock is held, so
/// transitions arrive in the order the table applied them. Implementations
/// must not call back into the table and must tolerate repeated calls with
/// the same effect.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, node: &Node, is_online: bool);
}

impl<F> ChangeListener for F
where
    F: Fn(&Node, bool) + Send + Sync,
{
    fn on_change(&self, node: &Node, is_online: bool) {
        self(node, is_online)
    }
}

/// Listener that ignores every transition.
pub struct NoopListener;

impl ChangeListener for NoopListener {
    fn on_change(&self, _node: &Node, _is_online: bool) {}
}

/// Device id -> Node map shared by the control loop and its readers.
pub struct MembershipTable {
    nodes: RwLock<HashMap<String, Node>>,
    listener: Arc<dyn ChangeListener>,
}

impl Default for MembershipTable {
    fn default() -> Self {
        Self::new(Arc::new(NoopListener))
    }
}

impl MembershipTable {
    pub fn new(listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            listener,
        }
    }

    // A listener that panicked must not take the whole table down with it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Node>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(
        &self,
        device_id: &str,
        domain: &str,
        address: Ipv4Addr,
        display_name: &str,
    ) -> bool {
        self.upsert_at(SystemTime::now(), device_id, domain, address, display_name)
    }

    /// Insert or refresh a node as of `now`.
    ///
    /// Returns true when the node is new, any of its fields changed, or it
    /// was offline and has now recovered.
    pub fn upsert_at(
        &self,
        now: SystemTime,
        device_id: &str,
        domain: &str,
        address: Ipv4Addr,
        display_name: &str,
    ) -> bool {
        let mut nodes = self.write();

        let Some(node) = nodes.get_mut(device_id) else {
            let node = Node::new(device_id, domain, address, display_name, now);
            self.listener.on_change(&node, true);
            nodes.insert(device_id.to_string(), node);
            return true;
        };

        let mut changed = false;
        if node.address != address {
            node.address = address;
            changed = true;
        }
        if node.domain != domain {
            node.domain = domain.to_string();
            changed = true;
        }
        if node.display_name != display_name {
            node.display_name = display_name.to_string();
            changed = true;
        }
        node.last_seen = now;

        let recovered = !node.is_online;
        node.is_online = true;

        let changed = changed || recovered;
        if changed && !node.is_local {
            self.listener.on_change(node, true);
        }
        changed
    }

    /// Insert this instance's own record. The listener is not told about it
    /// and it never expires.
    pub fn insert_local(
        &self,
        device_id: &str,
        domain: &str,
        address: Ipv4Addr,
        display_name: &str,
    ) {
        let mut node = Node::new(device_id, domain, address, display_name, SystemTime::now());
        node.is_local = true;

        let mut nodes = self.write();
        for other in nodes.values_mut() {
            other.is_local = false;
        }
        nodes.insert(device_id.to_string(), node);
    }

    /// Mark an already inserted node as the local one.
    pub fn set_local(&self, device_id: &str) {
        let mut nodes = self.write();
        if !nodes.contains_key(device_id) {
            return;
        }
        for (id, node) in nodes.iter_mut() {
            node.is_local = id == device_id;
        }
    }

    pub fn mark_offline(&self, device_id: &str) -> Option<Node> {
        let mut nodes = self.write();
        let node = nodes.get_mut(device_id)?;
        if node.is_local || !node.is_online {
            return None;
        }
        node.is_online = false;
        self.listener.on_change(node, false);
        Some(node.clone())
    }

    /// Forget a node. An online node is first taken offline so the listener
    /// never sees it vanish silently. The local node cannot be removed.
    pub fn remove(&self, device_id: &str) -> Option<Node> {
        let mut nodes = self.write();
        let node = nodes.get_mut(device_id)?;
        if node.is_local {
            return None;
        }
        if node.is_online {
            node.is_online = false;
            self.listener.on_change(node, false);
        }
        nodes.remove(device_id)
    }

    /// Take every non-local node silent for longer than `offline_timeout`
    /// offline. Records are kept so a later heartbeat counts as a recovery.
    pub fn sweep(&self, now: SystemTime, offline_timeout: Duration) -> Vec<Node> {
        let mut nodes = self.write();
        let mut expired = Vec::new();

        for node in nodes.values_mut() {
            if node.is_local || !node.is_online {
                continue;
            }
            if node.is_expired(now, offline_timeout) {
                node.is_online = false;
                self.listener.on_change(node, false);
                expired.push(node.clone());
            }
        }

        expired
    }

    pub fn get(&self, device_id: &str) -> Option<Node> {
        self.read().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.read().contains_key(device_id)
    }

    pub fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.domain.cmp(&b.domain));
        nodes
    }

    pub fn online_count(&self) -> usize {
        self.read().values().filter(|n| n.is_online).count()
    }

    pub fn local(&self) -> Option<Node> {
        self.read().values().find(|n| n.is_local).cloned()
    }

    /// True when a device other than `device_id` already holds `domain`.
    /// Names compare case-insensitively, the way resolvers look them up.
    pub fn has_domain_conflict(&self, domain: &str, device_id: &str) -> bool {
        self.read()
            .values()
            .any(|n| n.domain.eq_ignore_ascii_case(domain) && n.device_id != device_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<(String, bool)>>>;

    fn recording_table() -> (MembershipTable, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let table = MembershipTable::new(Arc::new(move |node: &Node, online: bool| {
            sink.lock().unwrap().push((node.device_id.clone(), online));
        }));
        (table, events)
    }

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn upsert_is_idempotent() {
        let (table, events) = recording_table();
        assert!(table.upsert_at(t(100), "mac-a", "a.local", IP, "a"));
        assert!(!table.upsert_at(t(105), "mac-a", "a.local", IP, "a"));

        assert_eq!(table.get("mac-a").unwrap().last_seen, t(105));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn upsert_reports_field_changes() {
        let (table, events) = recording_table();
        table.upsert_at(t(100), "mac-a", "a.local", IP, "a");
        assert!(table.upsert_at(t(101), "mac-a", "a.local", Ipv4Addr::new(10, 0, 0, 9), "a"));
        assert!(table.upsert_at(t(102), "mac-a", "a.local", Ipv4Addr::new(10, 0, 0, 9), "a2"));

        let node = table.get("mac-a").unwrap();
        assert_eq!(node.address, Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(node.display_name, "a2");
        assert_eq!(events.lock().unwrap().len(), 3);
    }

    #[test]
    fn sweep_respects_timeout_boundary() {
        let (table, _) = recording_table();
        table.upsert_at(t(100), "mac-a", "a.local", IP, "a");

        let early = t(100) + TIMEOUT - Duration::from_millis(1);
        assert!(table.sweep(early, TIMEOUT).is_empty());

        let late = t(100) + TIMEOUT + Duration::from_millis(1);
        let expired = table.sweep(late, TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert!(!expired[0].is_online);
        // retained for recovery
        assert!(table.contains("mac-a"));
        assert_eq!(table.online_count(), 0);
    }

    #[test]
    fn recovery_after_sweep_fires_online() {
        let (table, events) = recording_table();
        table.upsert_at(t(100), "mac-a", "a.local", IP, "a");
        table.sweep(t(131), TIMEOUT);
        assert!(table.upsert_at(t(140), "mac-a", "a.local", IP, "a"));

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("mac-a".to_string(), true),
                ("mac-a".to_string(), false),
                ("mac-a".to_string(), true),
            ]
        );
        assert!(table.get("mac-a").unwrap().is_online);
    }

    #[test]
    fn sweep_never_reports_offline_twice() {
        let (table, events) = recording_table();
        table.upsert_at(t(100), "mac-a", "a.local", IP, "a");
        assert_eq!(table.sweep(t(200), TIMEOUT).len(), 1);
        assert!(table.sweep(t(300), TIMEOUT).is_empty());
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn local_node_is_immune_and_silent() {
        let (table, events) = recording_table();
        table.insert_local("mac-self", "self.local", IP, "self");
        assert!(events.lock().unwrap().is_empty());

        let far_future = SystemTime::now() + Duration::from_secs(86_400);
        assert!(table.sweep(far_future, TIMEOUT).is_empty());
        assert!(table.mark_offline("mac-self").is_none());
        assert!(table.remove("mac-self").is_none());
        assert!(table.get("mac-self").unwrap().is_online);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn set_local_keeps_a_single_local_node() {
        let (table, _) = recording_table();
        table.upsert_at(t(1), "mac-a", "a.local", IP, "a");
        table.upsert_at(t(1), "mac-b", "b.local", IP, "b");
        table.set_local("mac-a");
        table.set_local("mac-b");
        table.set_local("mac-unknown");

        let locals: Vec<_> = table.list().into_iter().filter(|n| n.is_local).collect();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].device_id, "mac-b");
        assert!(table.sweep(t(1_000), TIMEOUT).iter().all(|n| n.device_id == "mac-a"));
    }

    #[test]
    fn mark_offline_only_affects_online_nodes() {
        let (table, events) = recording_table();
        assert!(table.mark_offline("mac-a").is_none());
        table.upsert_at(t(1), "mac-a", "a.local", IP, "a");
        assert!(table.mark_offline("mac-a").is_some());
        assert!(table.mark_offline("mac-a").is_none());
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn remove_synthesizes_offline_transition() {
        let (table, events) = recording_table();
        table.upsert_at(t(1), "mac-a", "a.local", IP, "a");
        let removed = table.remove("mac-a").unwrap();
        assert!(!removed.is_online);
        assert!(table.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![("mac-a".to_string(), true), ("mac-a".to_string(), false)]
        );

        // already offline: no second offline event
        table.upsert_at(t(2), "mac-b", "b.local", IP, "b");
        table.mark_offline("mac-b");
        table.remove("mac-b");
        assert_eq!(events.lock().unwrap().len(), 4);
        assert!(table.remove("mac-b").is_none());
    }

    #[test]
    fn domain_conflict_ignores_own_claim() {
        let (table, _) = recording_table();
        table.upsert_at(t(1), "mac-a", "host.local", IP, "a");
        assert!(table.has_domain_conflict("host.local", "mac-b"));
        assert!(!table.has_domain_conflict("host.local", "mac-a"));
        assert!(!table.has_domain_conflict("other.local", "mac-b"));
    }

    #[test]
    fn domain_conflict_ignores_case() {
        let (table, _) = recording_table();
        table.upsert_at(t(1), "mac-a", "host.local", IP, "a");
        assert!(table.has_domain_conflict("Host.LOCAL", "mac-b"));
        assert!(!table.has_domain_conflict("HOST.local", "mac-a"));
    }
}
