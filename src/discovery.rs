use crate::config::{generate_domain, Config, ConfigError};
use crate::conflict;
use crate::identity::Identity;
use crate::membership::{ChangeListener, MembershipTable};
use crate::node::Node;
use crate::protocol::{Action, Announcement};
use crate::transport::{MulticastTransport, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Time given to the departure datagram to leave the socket buffer.
pub const DEPARTURE_GRACE: Duration = Duration::from_millis(100);

// Announcements waiting for the control loop. Beyond this the receive loop
// drops datagrams, which the protocol already tolerates.
const INBOUND_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What an inbound announcement did to the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Arrived {
        node: Node,
        renamed_from: Option<String>,
    },
    Updated(Node),
    Recovered(Node),
    /// Known node, nothing but `last_seen` moved.
    Refreshed,
    Departed(Node),
    Ignored,
}

/// Apply one peer announcement to `table`.
///
/// Announcements carrying our own device id are ignored: the local record
/// is only ever changed by this process.
pub fn apply_announcement(
    table: &MembershipTable,
    local_device_id: &str,
    msg: &Announcement,
) -> Outcome {
    if msg.device_id == local_device_id {
        return Outcome::Ignored;
    }

    match msg.action {
        Action::Heartbeat => {
            let previous = table.get(&msg.device_id);
            let domain = conflict::resolve_domain(table, &msg.device_id, &msg.domain);
            let changed = table.upsert(&msg.device_id, &domain, msg.ip, &msg.hostname);

            let Some(node) = table.get(&msg.device_id) else {
                return Outcome::Ignored;
            };
            match previous {
                None => Outcome::Arrived {
                    node,
                    renamed_from: (domain != msg.domain).then(|| msg.domain.clone()),
                },
                Some(_) if !changed => Outcome::Refreshed,
                Some(prev) if !prev.is_online => Outcome::Recovered(node),
                Some(_) => Outcome::Updated(node),
            }
        }
        Action::Offline => table
            .remove(&msg.device_id)
            .map_or(Outcome::Ignored, Outcome::Departed),
    }
}

/// Owns the transport and the membership table of one running instance.
pub struct DiscoveryEngine {
    config: Config,
    identity: Identity,
    domain: String,
    transport: MulticastTransport,
    membership: Arc<MembershipTable>,
    inbound: mpsc::Receiver<Announcement>,
    receiver: JoinHandle<()>,
}

impl DiscoveryEngine {
    /// Open the transport, register ourselves and announce our presence.
    pub async fn start(
        config: Config,
        identity: Identity,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;

        let domain = generate_domain(&identity.display_name, &config.domain_suffix);
        let transport = MulticastTransport::open(config.multicast_addr, config.multicast_port)?;

        let membership = Arc::new(MembershipTable::new(listener));
        membership.insert_local(
            &identity.device_id,
            &domain,
            transport.local_ip(),
            &identity.display_name,
        );

        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let receiver = transport.start_listening(move |msg| {
            if let Err(e) = tx.try_send(msg) {
                tracing::debug!(error = %e, "inbound queue unavailable, dropping announcement");
            }
        });

        tracing::info!(
            device_id = %identity.device_id,
            ip = %transport.local_ip(),
            %domain,
            group = %transport.group(),
            "discovery started"
        );

        let engine = Self {
            config,
            identity,
            domain,
            transport,
            membership,
            inbound,
            receiver,
        };
        engine.send_heartbeat().await;
        Ok(engine)
    }

    pub fn membership(&self) -> Arc<MembershipTable> {
        self.membership.clone()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_node(&self) -> Option<Node> {
        self.membership.local()
    }

    fn announcement(&self, action: Action) -> Announcement {
        let ip = self.transport.local_ip();
        let id = &self.identity;
        match action {
            Action::Heartbeat => {
                Announcement::heartbeat(&self.domain, ip, &id.device_id, &id.display_name)
            }
            Action::Offline => {
                Announcement::departure(&self.domain, ip, &id.device_id, &id.display_name)
            }
        }
    }

    async fn send_heartbeat(&self) {
        match self.transport.send(&self.announcement(Action::Heartbeat)).await {
            Ok(()) => tracing::debug!(domain = %self.domain, "heartbeat sent"),
            // the next tick is the retry
            Err(e) => tracing::error!(error = %e, "failed to send heartbeat"),
        }
    }

    fn sweep(&self) {
        let expired = self
            .membership
            .sweep(SystemTime::now(), self.config.offline_timeout());
        for node in &expired {
            tracing::info!(device_id = %node.device_id, "node offline: {}", node);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "offline sweep finished");
        }
    }

    fn handle_announcement(&self, msg: Announcement) {
        tracing::debug!(
            action = %msg.action,
            from = %msg.hostname,
            ip = %msg.ip,
            "announcement received"
        );

        match apply_announcement(&self.membership, &self.identity.device_id, &msg) {
            Outcome::Arrived { node, renamed_from } => {
                if let Some(claimed) = renamed_from {
                    tracing::warn!(
                        device_id = %node.device_id,
                        "domain {} already taken, admitted as {}",
                        claimed,
                        node.domain
                    );
                }
                tracing::info!(device_id = %node.device_id, "node online: {}", node);
            }
            Outcome::Updated(node) => {
                tracing::info!(device_id = %node.device_id, "node updated: {}", node);
            }
            Outcome::Recovered(node) => {
                tracing::info!(device_id = %node.device_id, "node back online: {}", node);
            }
            Outcome::Departed(node) => {
                tracing::info!(device_id = %node.device_id, "node left: {}", node);
            }
            Outcome::Refreshed => {
                tracing::trace!(device_id = %msg.device_id, "heartbeat refreshed");
            }
            Outcome::Ignored => {
                tracing::debug!(device_id = %msg.device_id, "announcement ignored");
            }
        }
    }

    /// Drive heartbeats, offline sweeps and inbound announcements until
    /// `shutdown` resolves, then announce our departure.
    pub async fn run<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let heartbeat_every = self.config.heartbeat_interval();
        let sweep_every = self.config.offline_check_interval();

        // the startup heartbeat was already sent
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = heartbeat.tick() => self.send_heartbeat().await,
                _ = sweep.tick() => self.sweep(),
                Some(msg) = self.inbound.recv() => self.handle_announcement(msg),
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(self) {
        tracing::info!("shutting down, announcing departure");
        match self.transport.send(&self.announcement(Action::Offline)).await {
            Ok(()) => tracing::info!("departure sent"),
            Err(e) => tracing::error!(error = %e, "failed to send departure"),
        }
        tokio::time::sleep(DEPARTURE_GRACE).await;

        self.transport.close();
        if let Err(e) = self.receiver.await {
            tracing::warn!(error = %e, "receive loop ended abnormally");
        }
        tracing::info!("discovery stopped");
    }
}
