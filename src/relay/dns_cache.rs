use dashmap::DashMap;
use sfucore::net::ResolvedAddrs;

/// Last known addresses per relay host, shared by every relay connection of
/// the process. Entries are only overwritten or removed, never merged.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: DashMap<String, ResolvedAddrs>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<ResolvedAddrs> {
        self.entries.get(host).map(|e| e.value().clone())
    }

    /// Stores `addrs` for `host`. Returns true if the address set changed.
    pub fn set(&self, host: &str, addrs: ResolvedAddrs) -> bool {
        let changed = self
            .entries
            .get(host)
            .is_none_or(|current| !current.same_set(&addrs));
        if changed {
            self.entries.insert(host.to_string(), addrs);
        }
        changed
    }

    pub fn matches(&self, host: &str, addrs: &ResolvedAddrs) -> bool {
        self.entries
            .get(host)
            .is_some_and(|current| current.same_set(addrs))
    }

    pub fn remove(&self, host: &str) {
        self.entries.remove(host);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
