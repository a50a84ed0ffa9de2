//! Discovered-peer table: expiring presence records keyed by stable peer id.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::DeviceKind;

/// Default liveness window: peers not refreshed for this long are pruned.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(25);

/// One observed peer. IPs accumulate across presence datagrams until the entry expires.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAddress {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub ips: BTreeSet<String>,
    pub port: u16,
    pub last_seen: Instant,
}

impl PeerAddress {
    pub fn ip_list(&self) -> Vec<String> {
        self.ips.iter().cloned().collect()
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Refreshed,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerAddress>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. New IPs are merged into the existing set; name, kind
    /// and port take the latest values.
    pub fn upsert(
        &mut self,
        id: &str,
        name: &str,
        kind: DeviceKind,
        ips: impl IntoIterator<Item = String>,
        port: u16,
        now: Instant,
    ) -> Upsert {
        match self.peers.get_mut(id) {
            Some(existing) => {
                existing.ips.extend(ips);
                existing.name = name.to_string();
                existing.kind = kind;
                existing.port = port;
                existing.last_seen = now;
                Upsert::Refreshed
            }
            None => {
                self.peers.insert(
                    id.to_string(),
                    PeerAddress {
                        id: id.to_string(),
                        name: name.to_string(),
                        kind,
                        ips: ips.into_iter().collect(),
                        port,
                        last_seen: now,
                    },
                );
                Upsert::Inserted
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerAddress> {
        self.peers.remove(id)
    }

    /// Drop peers whose last presence is older than `liveness`. Returns removed ids.
    pub fn prune(&mut self, now: Instant, liveness: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > liveness)
            .map(|p| p.id.clone())
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    pub fn get(&self, id: &str) -> Option<&PeerAddress> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Copy of every entry, for publishing to readers outside the owning task.
    pub fn snapshot(&self) -> Vec<PeerAddress> {
        let mut all: Vec<PeerAddress> = self.peers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn repeated_presence_keeps_one_entry_with_ip_union() {
        let now = Instant::now();
        let mut t = PeerTable::new();
        let first = t.upsert("p1", "Studio", DeviceKind::Desktop, ips(&["192.168.1.2"]), 6996, now);
        let second = t.upsert(
            "p1",
            "Studio",
            DeviceKind::Desktop,
            ips(&["192.168.1.2", "100.80.0.4"]),
            6996,
            now + Duration::from_secs(1),
        );
        assert_eq!(first, Upsert::Inserted);
        assert_eq!(second, Upsert::Refreshed);
        assert_eq!(t.len(), 1);
        let p = t.get("p1").unwrap();
        assert_eq!(p.ip_list(), ips(&["100.80.0.4", "192.168.1.2"]));
        assert_eq!(p.last_seen, now + Duration::from_secs(1));
    }

    #[test]
    fn prune_removes_only_stale_peers() {
        let t0 = Instant::now();
        let mut t = PeerTable::new();
        t.upsert("old", "a", DeviceKind::Desktop, ips(&["10.0.0.1"]), 1, t0);
        t.upsert(
            "fresh",
            "b",
            DeviceKind::Desktop,
            ips(&["10.0.0.2"]),
            1,
            t0 + Duration::from_secs(20),
        );
        let removed = t.prune(t0 + Duration::from_secs(26), DEFAULT_LIVENESS_WINDOW);
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(t.get("fresh").is_some());
        assert!(t.prune(t0 + Duration::from_secs(30), DEFAULT_LIVENESS_WINDOW).is_empty());
    }

    #[test]
    fn peer_exactly_at_liveness_window_is_kept() {
        let t0 = Instant::now();
        let mut t = PeerTable::new();
        t.upsert("edge", "a", DeviceKind::Desktop, ips(&["10.0.0.1"]), 1, t0);
        assert!(t.prune(t0 + DEFAULT_LIVENESS_WINDOW, DEFAULT_LIVENESS_WINDOW).is_empty());
        let later = t0 + DEFAULT_LIVENESS_WINDOW + Duration::from_millis(1);
        assert_eq!(t.prune(later, DEFAULT_LIVENESS_WINDOW), vec!["edge".to_string()]);
    }

    #[test]
    fn remove_on_bye() {
        let mut t = PeerTable::new();
        t.upsert("p", "n", DeviceKind::Mobile, ips(&["10.0.0.3"]), 1, Instant::now());
        assert!(t.remove("p").is_some());
        assert!(t.is_empty());
        assert!(t.remove("p").is_none());
    }
}
