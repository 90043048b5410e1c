//! Per-announcer address table.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct AddrEntry {
    local_nif: Ipv4Addr,
    last_seen: Instant,
}

/// Currently-known reachable addresses of one announcer, each tagged with
/// the local interface it was heard on.
///
/// An address is evicted once it has not been re-announced for the staleness
/// timeout; callers that observe a change are expected to re-publish the
/// full surviving map.
#[derive(Debug, Default)]
pub struct RemoteLocator {
    entries: HashMap<Ipv4Addr, AddrEntry>,
}

impl RemoteLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes a sighting of `remote` on `local_nif`. Returns true when the
    /// surviving-address map changed.
    pub fn record(&mut self, remote: Ipv4Addr, local_nif: Ipv4Addr) -> bool {
        match self.entries.get_mut(&remote) {
            Some(entry) => {
                let changed = entry.local_nif != local_nif;
                entry.local_nif = local_nif;
                entry.last_seen = Instant::now();
                changed
            }
            None => {
                self.entries.insert(
                    remote,
                    AddrEntry {
                        local_nif,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Evicts entries at or past their staleness deadline. Returns true when
    /// anything was evicted.
    pub fn sweep(&mut self, stale_timeout: Duration) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_seen.elapsed() < stale_timeout);
        self.entries.len() != before
    }

    /// Full surviving map, remote address to local interface address.
    pub fn address_map(&self) -> HashMap<Ipv4Addr, Ipv4Addr> {
        self.entries
            .iter()
            .map(|(remote, entry)| (*remote, entry.local_nif))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn first_sighting_changes_map() {
        let mut locator = RemoteLocator::new();
        assert!(locator.record(addr("10.0.0.5"), addr("10.0.0.9")));
        assert_eq!(locator.len(), 1);
        assert_eq!(
            locator.address_map().get(&addr("10.0.0.5")),
            Some(&addr("10.0.0.9"))
        );
    }

    #[test]
    fn repeat_sighting_refreshes_without_change() {
        let mut locator = RemoteLocator::new();
        locator.record(addr("10.0.0.5"), addr("10.0.0.9"));
        assert!(!locator.record(addr("10.0.0.5"), addr("10.0.0.9")));
        assert_eq!(locator.len(), 1);
    }

    #[test]
    fn nif_move_counts_as_change() {
        let mut locator = RemoteLocator::new();
        locator.record(addr("10.0.0.5"), addr("10.0.0.9"));
        assert!(locator.record(addr("10.0.0.5"), addr("192.168.1.4")));
    }

    #[test]
    fn sweep_evicts_stale_entries() {
        let mut locator = RemoteLocator::new();
        locator.record(addr("10.0.0.5"), addr("10.0.0.9"));

        // Nothing is older than a generous timeout.
        assert!(!locator.sweep(Duration::from_secs(60)));
        assert_eq!(locator.len(), 1);

        // Zero timeout ages everything out.
        assert!(locator.sweep(Duration::ZERO));
        assert!(locator.is_empty());

        // A second sweep of the already-empty table reports no change.
        assert!(!locator.sweep(Duration::ZERO));
    }
}
