//! LAN discovery over UDP broadcast.
//!
//! Two loops share the discovery port's protocol. The sender broadcasts an
//! `announce` every tick (preceded by a `probe` every other tick) to the
//! limited broadcast address and to each interface's subnet broadcast. The
//! listener owns the bound discovery port: it answers probes with a unicast
//! announce and feeds every foreign sighting into the peer registry.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use xui_shared::constants::{
    ANNOUNCE_INTERVAL, BROADCAST_REFRESH_TICKS, LOCAL_ADDR_REFRESH, MAX_DATAGRAM_SIZE,
};
use xui_shared::error::{Result, XuiError};
use xui_shared::protocol::{DiscoveryKind, DiscoveryPacket};
use xui_shared::types::{NodeId, PeerSource};
use xui_shared::NodeIdentity;

use crate::events::EventBus;
use crate::registry::RegistryHandle;
use crate::shutdown::{self, ShutdownRx};

// ---------------------------------------------------------------------------
// Local interfaces
// ---------------------------------------------------------------------------

/// Snapshot of this host's IPv4/IPv6 addresses and subnet broadcasts.
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    addrs: HashSet<IpAddr>,
    broadcasts: Vec<Ipv4Addr>,
    loopback_is_local: bool,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self {
            addrs: HashSet::new(),
            broadcasts: Vec::new(),
            loopback_is_local: true,
        }
    }
}

impl LocalNetwork {
    /// Enumerate the local interfaces. An enumeration failure yields an
    /// empty snapshot; loopback is still recognised as local.
    pub fn scan() -> Self {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate network interfaces");
                return Self::default();
            }
        };

        let mut net = Self::default();
        for iface in interfaces {
            net.addrs.insert(iface.ip());
            if iface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(ref v4) = iface.addr {
                if let Some(bcast) = subnet_broadcast(v4.ip, v4.netmask, v4.broadcast) {
                    if !net.broadcasts.contains(&bcast) {
                        net.broadcasts.push(bcast);
                    }
                }
            }
        }
        trace!(addrs = net.addrs.len(), broadcasts = net.broadcasts.len(), "Scanned interfaces");
        net
    }

    /// Build a snapshot from explicit addresses.
    pub fn from_parts(addrs: impl IntoIterator<Item = IpAddr>, broadcasts: Vec<Ipv4Addr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
            broadcasts,
            loopback_is_local: true,
        }
    }

    /// Accept packets from loopback, so several nodes on one host can see
    /// each other. Explicitly listed addresses stay local.
    pub fn with_foreign_loopback(mut self) -> Self {
        self.loopback_is_local = false;
        self
    }

    /// True for loopback and for any address bound on this host.
    pub fn is_local(&self, ip: &IpAddr) -> bool {
        let ip = canonical_ip(*ip);
        (self.loopback_is_local && ip.is_loopback()) || self.addrs.contains(&ip)
    }

    /// Limited broadcast first, then each subnet broadcast.
    pub fn broadcast_targets(&self, port: u16) -> Vec<SocketAddr> {
        let mut targets = vec![SocketAddr::from((Ipv4Addr::BROADCAST, port))];
        for b in &self.broadcasts {
            if *b != Ipv4Addr::BROADCAST {
                targets.push(SocketAddr::from((*b, port)));
            }
        }
        targets
    }
}

fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr, advertised: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
    if let Some(b) = advertised {
        return Some(b);
    }
    // Point-to-point links have no broadcast domain.
    if netmask == Ipv4Addr::BROADCAST {
        return None;
    }
    Some(Ipv4Addr::from(u32::from(ip) | !u32::from(netmask)))
}

/// Unwrap IPv4-mapped IPv6 addresses.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

// ---------------------------------------------------------------------------
// Inbound classification
// ---------------------------------------------------------------------------

/// A peer worth registering, extracted from a datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub name: String,
    pub host: String,
    pub chat_port: u16,
    pub node_id: NodeId,
}

/// What the listener should do with one datagram.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Inbound {
    pub register: Option<Sighting>,
    /// Where to unicast an announce in answer to a probe.
    pub reply_to: Option<SocketAddr>,
}

/// Decide how to react to a parsed packet from `src`.
///
/// Returns `None` for our own packets and for anything sent from a local
/// address, so a node never registers itself.
pub fn classify(
    packet: &DiscoveryPacket,
    src: SocketAddr,
    local_id: &NodeId,
    local: &LocalNetwork,
) -> Option<Inbound> {
    if packet.node_id == *local_id || local.is_local(&src.ip()) {
        return None;
    }

    let host = canonical_ip(src.ip()).to_string();
    let register = (packet.chat_port != 0).then(|| Sighting {
        name: packet.name.clone(),
        host,
        chat_port: packet.chat_port,
        node_id: packet.node_id.clone(),
    });

    let reply_to = match packet.kind {
        DiscoveryKind::Probe => {
            let port = if packet.reply_port != 0 {
                packet.reply_port
            } else {
                src.port()
            };
            Some(SocketAddr::new(src.ip(), port))
        }
        DiscoveryKind::Announce => None,
    };

    Some(Inbound { register, reply_to })
}

// ---------------------------------------------------------------------------
// Sockets and loops
// ---------------------------------------------------------------------------

/// Bind the well-known discovery port with broadcast enabled.
pub async fn bind_listener(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await
        .map_err(|source| XuiError::Bind {
            what: "discovery port",
            port,
            source,
        })?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Periodic announce/probe broadcaster.
pub async fn run_sender(identity: NodeIdentity, bus: EventBus, mut shutdown_rx: ShutdownRx) {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Discovery sender socket unavailable");
            bus.status(format!("Discovery broadcast unavailable: {e}"));
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "Failed to enable broadcast");
    }

    let port = identity.discovery_port;
    let mut network = LocalNetwork::scan();
    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    let mut tick: u64 = 0;

    info!(port, "Discovery sender running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown::requested(&mut shutdown_rx) => break,
        }

        if tick > 0 && tick % BROADCAST_REFRESH_TICKS == 0 {
            network = LocalNetwork::scan();
        }

        let mut packets = Vec::with_capacity(2);
        if tick % 2 == 0 {
            packets.push(DiscoveryPacket::new(DiscoveryKind::Probe, &identity));
        }
        packets.push(DiscoveryPacket::new(DiscoveryKind::Announce, &identity));

        for packet in packets {
            let bytes = match packet.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Failed to encode discovery packet");
                    continue;
                }
            };
            for target in network.broadcast_targets(port) {
                if let Err(e) = socket.send_to(&bytes, target).await {
                    trace!(target = %target, error = %e, "Broadcast failed");
                }
            }
        }

        tick = tick.wrapping_add(1);
    }

    info!("Discovery sender stopped");
}

/// Receive loop on the bound discovery port. The local address set is
/// rescanned periodically.
pub async fn run_listener(
    socket: UdpSocket,
    identity: NodeIdentity,
    registry: RegistryHandle,
    shutdown_rx: ShutdownRx,
) {
    listen(socket, identity, registry, LocalNetwork::scan(), true, shutdown_rx).await;
}

/// Receive loop with a fixed view of the local network.
pub async fn run_listener_with(
    socket: UdpSocket,
    identity: NodeIdentity,
    registry: RegistryHandle,
    network: LocalNetwork,
    shutdown_rx: ShutdownRx,
) {
    listen(socket, identity, registry, network, false, shutdown_rx).await;
}

async fn listen(
    socket: UdpSocket,
    identity: NodeIdentity,
    registry: RegistryHandle,
    mut network: LocalNetwork,
    rescan: bool,
    mut shutdown_rx: ShutdownRx,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut refresh = tokio::time::interval(LOCAL_ADDR_REFRESH);
    refresh.tick().await;

    info!(port = identity.discovery_port, "Discovery listener running");

    loop {
        let (len, src) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms.
                    debug!(error = %e, "Discovery receive error");
                    continue;
                }
            },
            _ = refresh.tick() => {
                if rescan {
                    network = LocalNetwork::scan();
                }
                continue;
            }
            _ = shutdown::requested(&mut shutdown_rx) => break,
        };

        let packet = match DiscoveryPacket::from_bytes(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!(src = %src, error = %e, "Dropping malformed discovery packet");
                continue;
            }
        };

        let Some(inbound) = classify(&packet, src, &identity.node_id, &network) else {
            continue;
        };

        if let Some(reply_to) = inbound.reply_to {
            let reply = DiscoveryPacket::new(DiscoveryKind::Announce, &identity);
            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, reply_to).await {
                        debug!(to = %reply_to, error = %e, "Probe reply failed");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode probe reply"),
            }
        }

        if let Some(s) = inbound.register {
            if registry
                .upsert(&s.name, &s.host, s.chat_port, PeerSource::Lan, &s.node_id)
                .await
                .is_err()
            {
                break;
            }
        }
    }

    info!("Discovery listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::events::{EngineEvent, EventBus};

    fn packet(kind: DiscoveryKind, node: &str, chat_port: u16) -> DiscoveryPacket {
        DiscoveryPacket {
            kind,
            node_id: NodeId::from(node),
            name: "A".into(),
            chat_port,
            reply_port: 38599,
            ts: 0.0,
        }
    }

    fn lan(ip: &str, port: u16) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), port)
    }

    #[test]
    fn test_announce_registers_sender() {
        let net = LocalNetwork::default();
        let inbound = classify(
            &packet(DiscoveryKind::Announce, "a1", 38601),
            lan("192.168.1.20", 50000),
            &NodeId::from("b2"),
            &net,
        )
        .unwrap();

        let s = inbound.register.unwrap();
        assert_eq!(s.host, "192.168.1.20");
        assert_eq!(s.chat_port, 38601);
        assert_eq!(inbound.reply_to, None);
    }

    #[test]
    fn test_probe_gets_unicast_reply() {
        let inbound = classify(
            &packet(DiscoveryKind::Probe, "a1", 38601),
            lan("192.168.1.20", 50000),
            &NodeId::from("b2"),
            &LocalNetwork::default(),
        )
        .unwrap();
        assert_eq!(inbound.reply_to, Some(lan("192.168.1.20", 38599)));
        assert!(inbound.register.is_some());
    }

    #[test]
    fn test_probe_without_chat_port_is_answered_not_registered() {
        let mut p = packet(DiscoveryKind::Probe, "a1", 0);
        p.reply_port = 0;
        let inbound = classify(&p, lan("192.168.1.20", 50000), &NodeId::from("b2"), &LocalNetwork::default())
            .unwrap();
        assert!(inbound.register.is_none());
        assert_eq!(inbound.reply_to, Some(lan("192.168.1.20", 50000)));
    }

    #[test]
    fn test_ignores_self_and_local() {
        let net = LocalNetwork::from_parts(["192.168.1.7".parse().unwrap()], vec![]);
        let me = NodeId::from("b2");

        assert!(classify(&packet(DiscoveryKind::Announce, "b2", 38601), lan("192.168.1.20", 1), &me, &net).is_none());
        assert!(classify(&packet(DiscoveryKind::Announce, "a1", 38601), lan("192.168.1.7", 1), &me, &net).is_none());
        assert!(classify(&packet(DiscoveryKind::Announce, "a1", 38601), lan("127.0.0.1", 1), &me, &net).is_none());
        assert!(classify(&packet(DiscoveryKind::Announce, "a1", 38601), lan("::ffff:192.168.1.7", 1), &me, &net).is_none());
    }

    #[test]
    fn test_broadcast_targets() {
        let net = LocalNetwork::from_parts([], vec![Ipv4Addr::new(192, 168, 1, 255)]);
        let targets = net.broadcast_targets(38599);
        assert_eq!(targets, vec![lan("255.255.255.255", 38599), lan("192.168.1.255", 38599)]);
    }

    #[test]
    fn test_subnet_broadcast_math() {
        let ip = Ipv4Addr::new(10, 1, 2, 3);
        assert_eq!(
            subnet_broadcast(ip, Ipv4Addr::new(255, 255, 0, 0), None),
            Some(Ipv4Addr::new(10, 1, 255, 255))
        );
        assert_eq!(subnet_broadcast(ip, Ipv4Addr::BROADCAST, None), None);
        let adv = Ipv4Addr::new(10, 1, 2, 127);
        assert_eq!(subnet_broadcast(ip, Ipv4Addr::new(255, 255, 255, 128), Some(adv)), Some(adv));
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let socket = bind_listener(0).await.unwrap();
        let (bus, _events) = EventBus::channel();
        let (registry, actor) = RegistryHandle::channel(bus);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(actor.run(rx.clone()));

        let identity = NodeIdentity::generate("B", 38601, 0);
        let task = tokio::spawn(run_listener(socket, identity, registry, rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listener_ignores_loopback_packets() {
        let socket = bind_listener(0).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (bus, mut events) = EventBus::channel();
        let (registry, actor) = RegistryHandle::channel(bus);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(actor.run(rx.clone()));

        let identity = NodeIdentity::generate("B", 38601, port);
        tokio::spawn(run_listener(socket, identity, registry.clone(), rx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = packet(DiscoveryKind::Announce, "a1", 38601).to_bytes().unwrap();
        sender.send_to(&bytes, ("127.0.0.1", port)).await.unwrap();
        sender.send_to(b"{garbage", ("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(registry.snapshot().await.unwrap().is_empty());
        assert!(!events.drain().iter().any(|e| matches!(e, EngineEvent::PeerUp(_))));
        tx.send(true).unwrap();
    }

    #[test]
    fn test_foreign_loopback() {
        let me = NodeId::from("b2");
        let net = LocalNetwork::from_parts(["192.168.1.7".parse().unwrap()], vec![]).with_foreign_loopback();
        assert!(classify(&packet(DiscoveryKind::Announce, "a1", 38601), lan("127.0.0.1", 1), &me, &net).is_some());
        assert!(classify(&packet(DiscoveryKind::Announce, "a1", 38601), lan("192.168.1.7", 1), &me, &net).is_none());
        // Our own node id is still ignored.
        assert!(classify(&packet(DiscoveryKind::Announce, "b2", 38601), lan("127.0.0.1", 1), &me, &net).is_none());
    }

    async fn spawn_foreign_loopback_listener(
        identity_port: u16,
    ) -> (u16, NodeIdentity, RegistryHandle, watch::Sender<bool>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (bus, _events) = EventBus::channel();
        let (registry, actor) = RegistryHandle::channel(bus);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(actor.run(rx.clone()));

        let identity = NodeIdentity::generate("B", identity_port, port);
        let network = LocalNetwork::from_parts([], vec![]).with_foreign_loopback();
        tokio::spawn(run_listener_with(
            socket,
            identity.clone(),
            registry.clone(),
            network,
            rx,
        ));
        (port, identity, registry, tx)
    }

    #[tokio::test]
    async fn test_listener_registers_foreign_announce() {
        let (port, _identity, registry, tx) = spawn_foreign_loopback_listener(38601).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = packet(DiscoveryKind::Announce, "a1", 40123).to_bytes().unwrap();
        sender.send_to(&bytes, ("127.0.0.1", port)).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let peers = registry.snapshot().await.unwrap();
                if let Some(p) = peers.into_iter().find(|p| p.key() == "127.0.0.1:40123") {
                    return p;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(record.source, PeerSource::Lan);
        assert_eq!(record.node_id, NodeId::from("a1"));
        assert_eq!(record.name, "A");
        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_listener_answers_probe_with_unicast_announce() {
        let (port, identity, _registry, tx) = spawn_foreign_loopback_listener(38601).await;

        let prober = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut probe = packet(DiscoveryKind::Probe, "a1", 40123);
        probe.reply_port = prober.local_addr().unwrap().port();
        prober
            .send_to(&probe.to_bytes().unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), prober.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from.port(), port);

        let reply = DiscoveryPacket::from_bytes(&buf[..len]).unwrap();
        assert_eq!(reply.kind, DiscoveryKind::Announce);
        assert_eq!(reply.node_id, identity.node_id);
        assert_eq!(reply.chat_port, 38601);
        assert_eq!(reply.reply_port, port);
        tx.send(true).unwrap();
    }
}
