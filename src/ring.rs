//! Consistent hash ring: key -> server lookup built from hashed virtual
//! nodes, so that adding or removing one server reassigns only ~1/N of
//! keys.

use std::sync::RwLock;

/// Number of virtual nodes created per server.
pub const VNODES_PER_SERVER: usize = 1000;

/// One virtual node: a CRC32-IEEE hash of `server#i`, paired with the
/// server it stands in for.
#[derive(Debug, Clone)]
struct RingEntry {
    hash: u32,
    server: String,
}

/// Hashed positions for every admitted server, sorted ascending by hash.
///
/// Reads (`lookup`, `servers`) may run concurrently with each other;
/// `add`/`remove` are exclusive with everything else. Wrap the ring in
/// an `Arc` to share it between a synchronizer writer and dispatcher
/// readers.
#[derive(Debug, Default)]
pub struct HashRing {
    entries: RwLock<Vec<RingEntry>>,
}

fn vnode_hash(server: &str, index: usize) -> u32 {
    let label = format!("{server}#{index}");
    crc32fast::hash(label.as_bytes())
}

impl HashRing {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append `VNODES_PER_SERVER` entries for `server`, then re-sort.
    ///
    /// Not idempotent: calling this twice for the same server doubles
    /// its vnode count. Callers must check membership first.
    pub fn add(&self, server: &str) {
        let mut entries = self.entries.write().expect("hash ring lock poisoned");
        for i in 0..VNODES_PER_SERVER {
            entries.push(RingEntry {
                hash: vnode_hash(server, i),
                server: server.to_string(),
            });
        }
        entries.sort_by_key(|e| e.hash);
    }

    /// Drop every vnode belonging to `server`.
    pub fn remove(&self, server: &str) {
        let mut entries = self.entries.write().expect("hash ring lock poisoned");
        entries.retain(|e| e.server != server);
    }

    /// Find the server owning `key`: the first entry whose hash is >=
    /// `crc32(key)`, wrapping to index 0 if none qualifies. Returns
    /// `None` only when the ring has no entries.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().expect("hash ring lock poisoned");
        if entries.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key.as_bytes());
        let idx = entries.partition_point(|e| e.hash < hash);
        let idx = if idx == entries.len() { 0 } else { idx };
        Some(entries[idx].server.clone())
    }

    /// Distinct servers currently in the ring, sorted lexicographically.
    ///
    /// Stops scanning once `entries.len() / VNODES_PER_SERVER` distinct
    /// servers have been seen, mirroring the Go original's early exit,
    /// then sorts so dependent iteration order (the dispatcher's retry
    /// loop) is deterministic.
    pub fn servers(&self) -> Vec<String> {
        let entries = self.entries.read().expect("hash ring lock poisoned");
        if entries.is_empty() {
            return Vec::new();
        }
        let want = entries.len() / VNODES_PER_SERVER;
        let mut servers = Vec::new();
        for entry in entries.iter() {
            if !servers.contains(&entry.server) {
                servers.push(entry.server.clone());
            }
            if servers.len() == want {
                break;
            }
        }
        servers.sort();
        servers
    }
}
