//! LAN discovery: UDP presence broadcast, listen for peers, prune stale entries.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use duo_core::network::{directed_broadcast, is_advertisable, is_overlay_ipv4, is_peer_ip_admissible};
use duo_core::peers::DEFAULT_LIVENESS_WINDOW;
use duo_core::protocol::{decode_datagram, encode_datagram, Datagram, WakeUpTarget};
use duo_core::{DeviceKind, PeerAddress, PeerTable};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::LocalIdentity;

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(10);
const BYE_REPEATS: usize = 3;
const BYE_SPACING: Duration = Duration::from_millis(100);

/// Local IPv4 addresses by interface name.
pub trait InterfaceProvider: Send + Sync + 'static {
    fn ipv4_interfaces(&self) -> Vec<(String, Ipv4Addr)>;
}

/// Host interfaces via `getifaddrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceProvider for SystemInterfaces {
    fn ipv4_interfaces(&self) -> Vec<(String, Ipv4Addr)> {
        match local_ip_address::list_afinet_netifas() {
            Ok(list) => list
                .into_iter()
                .filter_map(|(name, ip)| match ip {
                    IpAddr::V4(v4) => Some((name, v4)),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list network interfaces");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Local UDP port to bind. 0 picks an ephemeral port.
    pub port: u16,
    /// Discovery port the peer listens on (broadcast and unicast destination).
    pub peer_port: u16,
    /// Transport port advertised in presence.
    pub transport_port: u16,
    /// Only presence from this kind of device is accepted.
    pub expected_kind: DeviceKind,
    pub enabled: bool,
    pub expanded_networking: bool,
    pub broadcast_interval: Duration,
    pub prune_interval: Duration,
    pub liveness: Duration,
}

impl DiscoverySettings {
    pub fn new(port: u16, transport_port: u16, expected_kind: DeviceKind) -> Self {
        Self {
            port,
            peer_port: port,
            transport_port,
            expected_kind,
            enabled: true,
            expanded_networking: false,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            liveness: DEFAULT_LIVENESS_WINDOW,
        }
    }
}

struct Shared<I> {
    identity: LocalIdentity,
    settings: DiscoverySettings,
    interfaces: I,
    enabled: AtomicBool,
    expanded: AtomicBool,
    local_has_overlay: AtomicBool,
    table: Mutex<PeerTable>,
    /// Unicast seeds that outlive the peer table, e.g. the persisted last peer.
    remembered: Mutex<BTreeSet<String>>,
    peers_tx: watch::Sender<Vec<PeerAddress>>,
    wake_tx: mpsc::UnboundedSender<WakeUpTarget>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

/// Presence protocol over UDP. `start` binds and spawns the loops, `stop` says bye.
pub struct DiscoveryService<I: InterfaceProvider = SystemInterfaces> {
    shared: Arc<Shared<I>>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<WakeUpTarget>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<I: InterfaceProvider> DiscoveryService<I> {
    pub fn new(identity: LocalIdentity, settings: DiscoverySettings, interfaces: I) -> Self {
        let (peers_tx, _) = watch::channel(Vec::new());
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity,
            enabled: AtomicBool::new(settings.enabled),
            expanded: AtomicBool::new(settings.expanded_networking),
            local_has_overlay: AtomicBool::new(false),
            settings,
            interfaces,
            table: Mutex::new(PeerTable::new()),
            remembered: Mutex::new(BTreeSet::new()),
            peers_tx,
            wake_tx,
            socket: Mutex::new(None),
        });
        shared.refresh_local_addresses();
        Self {
            shared,
            wake_rx: Mutex::new(Some(wake_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the socket and spawn broadcast, listen and prune loops. No-op if running.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        if let Some(socket) = self.shared.socket.lock().clone() {
            return socket.local_addr();
        }
        let socket = Arc::new(make_socket(self.shared.settings.port)?);
        let local = socket.local_addr()?;
        *self.shared.socket.lock() = Some(socket.clone());
        info!(addr = %local, "Discovery listening");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.shared.clone().broadcast_loop(socket.clone())));
        tasks.push(tokio::spawn(self.shared.clone().listen_loop(socket)));
        tasks.push(tokio::spawn(self.shared.clone().prune_loop()));
        Ok(local)
    }

    /// Announce departure (when enabled), then stop all loops and release the socket.
    pub async fn stop(&self) {
        let socket = self.shared.socket.lock().take();
        if let Some(socket) = &socket {
            if self.shared.enabled.load(Ordering::SeqCst) {
                self.shared.send_bye(socket).await;
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if socket.is_some() {
            info!("Discovery stopped");
        }
    }

    /// Snapshot feed of the peer table; updated on every change and every presence.
    pub fn peers(&self) -> watch::Receiver<Vec<PeerAddress>> {
        self.shared.peers_tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PeerAddress> {
        self.shared.table.lock().snapshot()
    }

    /// Wake-up requests received from peers. Only the first caller gets the receiver.
    pub fn take_wake_ups(&self) -> Option<mpsc::UnboundedReceiver<WakeUpTarget>> {
        self.wake_rx.lock().take()
    }

    /// Replace the unicast seeds, e.g. with the persisted last peer's addresses.
    /// Live peers are unicast too while they stay in the table.
    pub fn remember_peer_addresses(&self, ips: impl IntoIterator<Item = String>) {
        *self.shared.remembered.lock() = ips.into_iter().collect();
    }

    /// Broadcasting on/off. Listening continues either way.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_expanded_networking(&self, enabled: bool) {
        self.shared.expanded.store(enabled, Ordering::SeqCst);
    }

    /// Process one inbound datagram. Malformed input is ignored.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        self.shared.handle_datagram(bytes, from, Instant::now());
    }

    /// Remove peers not seen within the liveness window as of `now`.
    pub fn prune(&self, now: Instant) -> Vec<String> {
        self.shared.prune(now)
    }
}

fn make_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

impl<I: InterfaceProvider> Shared<I> {
    /// Advertisable local addresses; also refreshes the local overlay flag.
    fn refresh_local_addresses(&self) -> Vec<Ipv4Addr> {
        let expanded = self.expanded.load(Ordering::SeqCst);
        let interfaces = self.interfaces.ipv4_interfaces();
        self.local_has_overlay.store(
            interfaces.iter().any(|(_, ip)| is_overlay_ipv4(*ip)),
            Ordering::SeqCst,
        );
        let mut ips: Vec<Ipv4Addr> = interfaces
            .into_iter()
            .filter(|(name, ip)| is_advertisable(name, *ip, expanded))
            .map(|(_, ip)| ip)
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    fn presence(&self, ips: &[Ipv4Addr]) -> Datagram {
        Datagram::Presence {
            device_type: self.identity.kind,
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            port: self.settings.transport_port,
        }
    }

    fn destinations(&self, local_ips: &[Ipv4Addr]) -> Vec<SocketAddr> {
        let port = self.settings.peer_port;
        let mut out: Vec<SocketAddr> = vec![SocketAddr::from((Ipv4Addr::BROADCAST, port))];
        for ip in local_ips {
            let addr = SocketAddr::from((directed_broadcast(*ip), port));
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        let mut unicast = self.remembered.lock().clone();
        for peer in self.table.lock().snapshot() {
            unicast.extend(peer.ips);
        }
        for ip in &unicast {
            if let Ok(ip) = ip.parse::<IpAddr>() {
                let addr = SocketAddr::new(ip, port);
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
        out
    }

    async fn send_all(&self, socket: &UdpSocket, datagram: &Datagram, destinations: &[SocketAddr]) {
        let bytes = match encode_datagram(datagram) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Failed to encode discovery datagram");
                return;
            }
        };
        for dest in destinations {
            if let Err(e) = socket.send_to(&bytes, dest).await {
                trace!(dest = %dest, error = %e, "Discovery send failed");
            }
        }
    }

    async fn broadcast_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut ticker = tokio::time::interval(self.settings.broadcast_interval);
        loop {
            ticker.tick().await;
            let local_ips = self.refresh_local_addresses();
            if !self.enabled.load(Ordering::SeqCst) {
                continue;
            }
            let destinations = self.destinations(&local_ips);
            trace!(ips = ?local_ips, targets = destinations.len(), "Sending presence");
            self.send_all(&socket, &self.presence(&local_ips), &destinations)
                .await;
        }
    }

    async fn listen_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => self.handle_datagram(&buf[..n], from, Instant::now()),
                Err(e) => {
                    debug!(error = %e, "Discovery receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn prune_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.prune_interval);
        loop {
            ticker.tick().await;
            self.prune(Instant::now());
        }
    }

    async fn send_bye(&self, socket: &UdpSocket) {
        let bye = Datagram::Bye {
            device_type: self.identity.kind,
            id: self.identity.id.clone(),
        };
        let local_ips = self.refresh_local_addresses();
        let destinations = self.destinations(&local_ips);
        for i in 0..BYE_REPEATS {
            if i > 0 {
                tokio::time::sleep(BYE_SPACING).await;
            }
            self.send_all(socket, &bye, &destinations).await;
        }
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr, now: Instant) {
        let datagram = match decode_datagram(bytes) {
            Ok(d) => d,
            Err(e) => {
                trace!(from = %from, error = %e, "Ignoring unparseable datagram");
                return;
            }
        };
        match datagram {
            Datagram::Presence {
                device_type,
                id,
                name,
                ips,
                port,
            } => {
                if id == self.identity.id || device_type != self.settings.expected_kind {
                    return;
                }
                let expanded = self.expanded.load(Ordering::SeqCst);
                let local_overlay = self.local_has_overlay.load(Ordering::SeqCst);
                let admitted: BTreeSet<String> = ips
                    .into_iter()
                    .chain(std::iter::once(from.ip().to_string()))
                    .map(|ip| ip.trim().to_string())
                    .filter(|ip| is_peer_ip_admissible(ip, expanded, local_overlay))
                    .collect();
                if admitted.is_empty() {
                    trace!(peer = %id, "Presence carried no admissible address");
                    return;
                }
                let port = if port == 0 {
                    self.settings.transport_port
                } else {
                    port
                };
                let snapshot = {
                    let mut table = self.table.lock();
                    let outcome = table.upsert(&id, &name, device_type, admitted, port, now);
                    if outcome == duo_core::peers::Upsert::Inserted {
                        info!(peer = %name, id = %id, "Peer discovered");
                    }
                    table.snapshot()
                };
                self.peers_tx.send_replace(snapshot);
            }
            Datagram::Bye { id, .. } => {
                if id == self.identity.id {
                    return;
                }
                let snapshot = {
                    let mut table = self.table.lock();
                    if table.remove(&id).is_none() {
                        return;
                    }
                    table.snapshot()
                };
                info!(id = %id, "Peer said bye");
                self.peers_tx.send_replace(snapshot);
            }
            Datagram::WakeUpRequest { data } => {
                debug!(from = %from, target = %data.ip, "Wake-up request received");
                let _ = self.wake_tx.send(data);
            }
        }
    }

    fn prune(&self, now: Instant) -> Vec<String> {
        let (removed, snapshot) = {
            let mut table = self.table.lock();
            let removed = table.prune(now, self.settings.liveness);
            (removed, table.snapshot())
        };
        if !removed.is_empty() {
            info!(ids = ?removed, "Pruned stale peers");
            self.peers_tx.send_replace(snapshot);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duo_core::protocol::encode_datagram;

    struct StaticInterfaces(Vec<(String, Ipv4Addr)>);

    impl InterfaceProvider for StaticInterfaces {
        fn ipv4_interfaces(&self) -> Vec<(String, Ipv4Addr)> {
            self.0.clone()
        }
    }

    fn lan_only() -> StaticInterfaces {
        StaticInterfaces(vec![
            ("lo".into(), Ipv4Addr::LOCALHOST),
            ("eth0".into(), Ipv4Addr::new(192, 168, 1, 5)),
        ])
    }

    fn identity() -> LocalIdentity {
        LocalIdentity {
            id: "phone-1".into(),
            name: "Phone".into(),
            kind: DeviceKind::Mobile,
        }
    }

    fn service<I: InterfaceProvider>(interfaces: I) -> DiscoveryService<I> {
        DiscoveryService::new(
            identity(),
            DiscoverySettings::new(0, 6996, DeviceKind::Desktop),
            interfaces,
        )
    }

    fn presence(id: &str, kind: DeviceKind, ips: &[&str]) -> Vec<u8> {
        encode_datagram(&Datagram::Presence {
            device_type: kind,
            id: id.into(),
            name: "Studio".into(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            port: 6996,
        })
        .unwrap()
    }

    fn from(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 8889)
    }

    #[test]
    fn presence_is_idempotent_and_merges_ips() {
        let d = service(lan_only());
        let mut rx = d.peers();
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["192.168.1.20"]), from("192.168.1.20"));
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["192.168.1.20"]), from("192.168.1.20"));
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["10.0.0.20"]), from("10.0.0.20"));

        let peers = d.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip_list(), vec!["10.0.0.20", "192.168.1.20"]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn own_and_wrong_kind_are_ignored() {
        let d = service(lan_only());
        d.handle_datagram(&presence("phone-1", DeviceKind::Desktop, &["192.168.1.5"]), from("192.168.1.5"));
        d.handle_datagram(&presence("phone-2", DeviceKind::Mobile, &["192.168.1.6"]), from("192.168.1.6"));
        d.handle_datagram(b"{not json", from("192.168.1.7"));
        assert!(d.snapshot().is_empty());
    }

    #[test]
    fn overlay_addresses_need_expanded_or_local_overlay() {
        let d = service(lan_only());
        d.handle_datagram(
            &presence("desk-1", DeviceKind::Desktop, &["100.100.1.2", "192.168.1.20"]),
            from("192.168.1.20"),
        );
        assert_eq!(d.snapshot()[0].ip_list(), vec!["192.168.1.20"]);

        // Overlay-only presence from a peer we cannot reach that way is dropped entirely.
        let d = service(lan_only());
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["100.100.1.2"]), from("100.100.1.2"));
        assert!(d.snapshot().is_empty());

        let d = service(lan_only());
        d.set_expanded_networking(true);
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["100.100.1.2"]), from("100.100.1.2"));
        assert_eq!(d.snapshot()[0].ip_list(), vec!["100.100.1.2"]);

        let d = service(StaticInterfaces(vec![
            ("eth0".into(), Ipv4Addr::new(192, 168, 1, 5)),
            ("tailscale0".into(), Ipv4Addr::new(100, 101, 2, 3)),
        ]));
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["100.100.1.2"]), from("100.100.1.2"));
        assert_eq!(d.snapshot()[0].ip_list(), vec!["100.100.1.2"]);
    }

    #[test]
    fn bye_removes_peer() {
        let d = service(lan_only());
        let mut rx = d.peers();
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["192.168.1.20"]), from("192.168.1.20"));
        rx.borrow_and_update();
        let bye = encode_datagram(&Datagram::Bye {
            device_type: DeviceKind::Desktop,
            id: "desk-1".into(),
        })
        .unwrap();
        d.handle_datagram(&bye, from("192.168.1.20"));
        assert!(d.snapshot().is_empty());
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_empty());
    }

    #[test]
    fn stale_peers_are_pruned() {
        let d = service(lan_only());
        d.handle_datagram(&presence("desk-1", DeviceKind::Desktop, &["192.168.1.20"]), from("192.168.1.20"));
        assert!(d.prune(Instant::now()).is_empty());
        let removed = d.prune(Instant::now() + DEFAULT_LIVENESS_WINDOW + Duration::from_secs(1));
        assert_eq!(removed, vec!["desk-1".to_string()]);
        assert!(d.peers().borrow().is_empty());
    }

    #[test]
    fn wake_up_is_forwarded() {
        let d = service(lan_only());
        let mut wake = d.take_wake_ups().unwrap();
        assert!(d.take_wake_ups().is_none());
        let bytes = br#"{"type":"wakeUpRequest","data":{"macIP":"192.168.1.20","macPort":6996,"macName":"Studio"}}"#;
        d.handle_datagram(bytes, from("192.168.1.20"));
        let target = wake.try_recv().unwrap();
        assert_eq!(target.ip, "192.168.1.20");
        assert_eq!(target.port, 6996);
    }

    #[test]
    fn presence_advertises_filtered_addresses() {
        let d = service(StaticInterfaces(vec![
            ("lo".into(), Ipv4Addr::LOCALHOST),
            ("eth0".into(), Ipv4Addr::new(192, 168, 1, 5)),
            ("wg0".into(), Ipv4Addr::new(10, 8, 0, 2)),
            ("tailscale0".into(), Ipv4Addr::new(100, 101, 2, 3)),
        ]));
        let ips = d.shared.refresh_local_addresses();
        assert_eq!(ips, vec![Ipv4Addr::new(192, 168, 1, 5)]);
        d.set_expanded_networking(true);
        let ips = d.shared.refresh_local_addresses();
        assert_eq!(ips, vec![Ipv4Addr::new(100, 101, 2, 3), Ipv4Addr::new(192, 168, 1, 5)]);

        d.remember_peer_addresses(["192.168.1.20".to_string()]);
        let dests = d.shared.destinations(&ips);
        assert!(dests.contains(&SocketAddr::from((Ipv4Addr::BROADCAST, 0))));
        assert!(dests.contains(&SocketAddr::from((Ipv4Addr::new(192, 168, 1, 255), 0))));
        assert!(dests.contains(&SocketAddr::from((Ipv4Addr::new(192, 168, 1, 20), 0))));
    }

    #[test]
    fn unicast_targets_follow_the_peer_table() {
        let d = service(lan_only());
        d.remember_peer_addresses(["192.168.1.20".to_string()]);
        d.handle_datagram(
            &presence("desk-1", DeviceKind::Desktop, &["192.168.1.30"]),
            from("192.168.1.31"),
        );
        let unicast = |d: &DiscoveryService<StaticInterfaces>| -> Vec<IpAddr> {
            d.shared
                .destinations(&[])
                .into_iter()
                .map(|a| a.ip())
                .filter(|ip| *ip != IpAddr::V4(Ipv4Addr::BROADCAST))
                .collect()
        };
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        assert_eq!(unicast(&d), vec![ip("192.168.1.20"), ip("192.168.1.30"), ip("192.168.1.31")]);

        let bye = encode_datagram(&Datagram::Bye {
            device_type: DeviceKind::Desktop,
            id: "desk-1".into(),
        })
        .unwrap();
        d.handle_datagram(&bye, from("192.168.1.31"));
        assert_eq!(unicast(&d), vec![ip("192.168.1.20")]);

        d.remember_peer_addresses(Vec::new());
        assert!(unicast(&d).is_empty());
    }

    #[tokio::test]
    async fn udp_presence_and_bye_over_loopback() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        let mut settings = DiscoverySettings::new(0, 6996, DeviceKind::Desktop);
        settings.peer_port = peer_port;
        let d = DiscoveryService::new(identity(), settings, lan_only());
        d.remember_peer_addresses(["127.0.0.1".to_string()]);
        let local = d.start().await.unwrap();
        let mut rx = d.peers();

        // Our own presence arrives at the remembered unicast address.
        let mut buf = vec![0u8; 65536];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(decode_datagram(&buf[..n]).unwrap(), Datagram::Presence { .. }));

        let bytes = presence("desk-1", DeviceKind::Desktop, &["192.168.1.20"]);
        peer.send_to(&bytes, ("127.0.0.1", local.port())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().len(), 1);

        d.stop().await;
        let mut byes = 0;
        while let Ok(Ok((n, _))) =
            tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await
        {
            if matches!(decode_datagram(&buf[..n]), Ok(Datagram::Bye { .. })) {
                byes += 1;
            }
        }
        assert_eq!(byes, BYE_REPEATS);
    }
}
