use crate::protocol::{unix_timestamp, Announcement, MAX_DATAGRAM_SIZE};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// Pause after a failed receive, doubled per consecutive failure.
const RECV_BACKOFF_START: Duration = Duration::from_millis(50);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(Ipv4Addr),
    #[error("failed to bind UDP port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("no non-loopback IPv4 address found")]
    NoLocalAddress,
    #[error("could not join multicast group {0} on any interface")]
    NoInterface(Ipv4Addr),
    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// UDP socket joined to one IPv4 multicast group.
///
/// Cloning shares the socket; `close` on any clone stops the receive loop
/// and makes every clone refuse further sends.
#[derive(Clone)]
pub struct MulticastTransport {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    local_ip: Ipv4Addr,
    closed: Arc<watch::Sender<bool>>,
}

impl MulticastTransport {
    /// Bind `0.0.0.0:port` and join `group` on every usable interface.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(group: Ipv4Addr, port: u16) -> Result<Self, TransportError> {
        if !group.is_multicast() {
            return Err(TransportError::NotMulticast(group));
        }

        let local_ip = local_ipv4()?;
        let socket = bind_reusable(port).map_err(|source| TransportError::Bind { port, source })?;

        let mut joined = 0;
        for iface in multicast_interfaces() {
            match socket.join_multicast_v4(group, iface) {
                Ok(()) => {
                    tracing::debug!(%group, interface = %iface, "joined multicast group");
                    joined += 1;
                }
                Err(e) => {
                    tracing::debug!(%group, interface = %iface, error = %e, "join failed");
                }
            }
        }
        if joined == 0 {
            return Err(TransportError::NoInterface(group));
        }

        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            group: SocketAddrV4::new(group, port),
            local_ip,
            closed: Arc::new(closed),
        })
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one announcement to the group, stamped with the current time.
    /// Failures are returned to the caller and never retried here.
    pub async fn send(&self, msg: &Announcement) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut msg = msg.clone();
        msg.timestamp = unix_timestamp();
        let data = msg.encode()?;

        self.socket.send_to(&data, self.group).await?;
        Ok(())
    }

    /// Spawn the receive loop. `on_receive` gets every well-formed
    /// announcement that did not originate from our own address.
    pub fn start_listening<F>(&self, on_receive: F) -> JoinHandle<()>
    where
        F: Fn(Announcement) + Send + Sync + 'static,
    {
        let socket = self.socket.clone();
        let local_ip = self.local_ip;
        let mut closed = self.closed.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let mut failures: u32 = 0;
            loop {
                if *closed.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((len, from)) => {
                            failures = 0;
                            accept_datagram(&buf[..len], from, local_ip, &on_receive);
                        }
                        Err(e) => {
                            if *closed.borrow() {
                                break;
                            }
                            let pause = recv_backoff(failures);
                            failures = failures.saturating_add(1);
                            if failures == 1 {
                                tracing::warn!(error = %e, "multicast receive failed");
                            } else {
                                tracing::debug!(
                                    error = %e,
                                    failures,
                                    "multicast receive failed again"
                                );
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = closed.changed() => {}
                            }
                        }
                    },
                    res = closed.changed() => {
                        // every transport handle is gone
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("multicast receive loop stopped");
        })
    }

    /// Stop the receive loop and refuse further sends.
    pub fn close(&self) {
        self.closed.send_replace(true);
        let group = *self.group.ip();
        for iface in multicast_interfaces() {
            if let Err(e) = self.socket.leave_multicast_v4(group, iface) {
                tracing::debug!(%group, interface = %iface, error = %e, "leave failed");
            }
        }
    }
}

/// Pause before retrying after `failures` consecutive receive errors.
fn recv_backoff(failures: u32) -> Duration {
    RECV_BACKOFF_START
        .saturating_mul(1u32 << failures.min(16))
        .min(RECV_BACKOFF_MAX)
}

fn accept_datagram<F>(data: &[u8], from: SocketAddr, local_ip: Ipv4Addr, on_receive: &F)
where
    F: Fn(Announcement),
{
    match Announcement::decode(data) {
        Ok(msg) if msg.ip == local_ip => {
            tracing::trace!(device_id = %msg.device_id, "ignoring own announcement");
        }
        Ok(msg) => on_receive(msg),
        Err(e) => {
            tracing::debug!(%from, error = %e, "dropping malformed datagram");
        }
    }
}

fn bind_reusable(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Lets several instances (and the tests) share the group port on one host.
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Every non-loopback IPv4 interface address.
fn multicast_interfaces() -> Vec<Ipv4Addr> {
    let ifaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list network interfaces");
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in ifaces {
        if let IpAddr::V4(v4) = ip {
            if !v4.is_loopback() && !addrs.contains(&v4) {
                addrs.push(v4);
            }
        }
    }
    addrs
}

/// Address announced as ours: the default-route address when the OS can
/// tell us, otherwise the first non-loopback IPv4 interface address.
pub fn local_ipv4() -> Result<Ipv4Addr, TransportError> {
    if let Ok(IpAddr::V4(ip)) = local_ip_address::local_ip() {
        if !ip.is_loopback() {
            return Ok(ip);
        }
    }
    multicast_interfaces()
        .into_iter()
        .next()
        .ok_or(TransportError::NoLocalAddress)
}
