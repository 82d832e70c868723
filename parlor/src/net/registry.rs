//! The connection table.
//!
//! Tracks every live connection keyed by a stable handle. The handle doubles
//! as the mio token; it is issued from a counter and never reused, so a late
//! readiness event for a closed connection can only miss the map, never hit a
//! stranger.
//!
//! Teardown is two-phase: command handlers running on worker threads only
//! *mark* a connection for removal (appending to a pending list under its own
//! leaf mutex); the event loop *performs* deregister-and-close under the
//! connection-table lock once per iteration. This keeps handlers from racing
//! the reader on the same socket.

use crate::net::codec::{self, FrameDecoder};
use crate::ClientId;
use ember::logging::{self, Logger};
use hashbrown::HashMap;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A single live connection and the per-connection state owned by the table.
pub struct Connection {
    pub stream: TcpStream,
    pub addr: String,
    /// Raw display nickname; empty until the connection authenticates.
    pub nickname: String,
    pub is_admin: bool,
    pub last_activity: Instant,
    pub decoder: FrameDecoder,
}

impl Connection {
    fn new(stream: TcpStream, addr: String) -> Connection {
        Connection {
            stream,
            addr,
            nickname: String::new(),
            is_admin: false,
            last_activity: Instant::now(),
            decoder: FrameDecoder::new(),
        }
    }
}

struct ClientMap {
    connections: HashMap<ClientId, Connection>,
    next_id: ClientId,
}

/// Tracks all live connections under a single mutex, plus the pending-removal
/// list under its own leaf mutex.
pub struct ClientRegistry {
    clients: Mutex<ClientMap>,
    pending: Mutex<Vec<ClientId>>,
    log: Logger,
}

impl ClientRegistry {
    pub fn new(log: &Logger) -> ClientRegistry {
        ClientRegistry {
            clients: Mutex::new(ClientMap { connections: HashMap::new(), next_id: 1 }),
            pending: Mutex::new(Vec::new()),
            log: log.new(logging::o!("mod" => "registry")),
        }
    }

    /// Insert a freshly accepted connection and issue its handle.
    pub fn insert(&self, stream: TcpStream, addr: String) -> ClientId {
        let mut map = self.clients.lock();
        let id = map.next_id;
        map.next_id += 1;
        map.connections.insert(id, Connection::new(stream, addr));
        id
    }

    /// Remove a connection outright, handing the record (and its socket) back
    /// to the caller. Only the event loop's teardown sweep calls this.
    pub fn remove(&self, id: ClientId) -> Option<Connection> {
        self.clients.lock().connections.remove(&id)
    }

    /// Run `body` against the connection's record, if it is still live.
    pub fn with_conn_mut<T>(&self, id: ClientId, body: impl FnOnce(&mut Connection) -> T) -> Option<T> {
        self.clients.lock().connections.get_mut(&id).map(body)
    }

    /// Refresh the connection's last-activity timestamp.
    pub fn touch(&self, id: ClientId) {
        if let Some(conn) = self.clients.lock().connections.get_mut(&id) {
            conn.last_activity = Instant::now();
        }
    }

    /// The connection's raw nickname. `Some("")` means live but not yet
    /// authenticated; `None` means the connection is gone.
    pub fn nickname_of(&self, id: ClientId) -> Option<String> {
        self.clients
            .lock()
            .connections
            .get(&id)
            .map(|conn| conn.nickname.clone())
    }

    pub fn admin_flag(&self, id: ClientId) -> bool {
        self.clients
            .lock()
            .connections
            .get(&id)
            .map_or(false, |conn| conn.is_admin)
    }

    /// Atomically assign a nickname to a connection, refusing if any live
    /// connection already carries the same raw nickname. Exactly one
    /// connection per nickname is admitted concurrently.
    pub fn claim_nickname(&self, id: ClientId, raw: &str, is_admin: bool) -> bool {
        let mut map = self.clients.lock();

        if map.connections.values().any(|conn| conn.nickname == raw) {
            return false;
        }

        match map.connections.get_mut(&id) {
            Some(conn) => {
                conn.nickname = raw.to_string();
                conn.is_admin = is_admin;
                true
            }
            None => false,
        }
    }

    /// Linear scan for the connection holding exactly this raw nickname.
    pub fn find_by_raw_nickname(&self, raw: &str) -> Option<ClientId> {
        self.clients
            .lock()
            .connections
            .iter()
            .find(|(_, conn)| conn.nickname == raw)
            .map(|(id, _)| *id)
    }

    /// Linear scan matching on the lowercased nickname, as group members are
    /// keyed by their lowercase form.
    pub fn find_by_lower_nickname(&self, lower: &str) -> Option<ClientId> {
        self.clients
            .lock()
            .connections
            .iter()
            .find(|(_, conn)| !conn.nickname.is_empty() && conn.nickname.to_lowercase() == lower)
            .map(|(id, _)| *id)
    }

    /// Handles of every live connection.
    pub fn snapshot_ids(&self) -> Vec<ClientId> {
        self.clients.lock().connections.keys().copied().collect()
    }

    /// Handle and nickname of every authenticated connection.
    pub fn named_snapshot(&self) -> Vec<(ClientId, String)> {
        self.clients
            .lock()
            .connections
            .iter()
            .filter(|(_, conn)| !conn.nickname.is_empty())
            .map(|(id, conn)| (*id, conn.nickname.clone()))
            .collect()
    }

    /// Connections whose last activity is older than `threshold` at `now`.
    pub fn idle_ids(&self, threshold: Duration, now: Instant) -> Vec<ClientId> {
        self.clients
            .lock()
            .connections
            .iter()
            .filter(|(_, conn)| now.saturating_duration_since(conn.last_activity) > threshold)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Send one framed message to a single connection. A failed send is
    /// logged and the recipient abandoned; it does not fail the caller.
    pub fn send_to(&self, id: ClientId, message: &str) -> bool {
        let mut map = self.clients.lock();
        match map.connections.get_mut(&id) {
            Some(conn) => match codec::write_frame(&mut conn.stream, message) {
                Ok(()) => true,
                Err(err) => {
                    logging::warn!(self.log, "send failed, abandoning recipient";
                                   "client_id" => id, "error" => %err);
                    false
                }
            },
            None => false,
        }
    }

    /// Fan one message out to every live connection except `exclude`.
    pub fn broadcast(&self, message: &str, exclude: Option<ClientId>) {
        let mut map = self.clients.lock();
        for (id, conn) in map.connections.iter_mut() {
            if Some(*id) == exclude {
                continue;
            }
            if let Err(err) = codec::write_frame(&mut conn.stream, message) {
                logging::warn!(self.log, "broadcast send failed, skipping recipient";
                               "client_id" => *id, "error" => %err);
            }
        }
    }

    /// Deliver one message to each of `lower_names`, resolving every name to
    /// its live connection. Offline names are silently skipped.
    pub fn send_to_lower_names<'a, I>(&self, lower_names: I, message: &str)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut map = self.clients.lock();
        for lower in lower_names {
            let conn = map
                .connections
                .values_mut()
                .find(|conn| !conn.nickname.is_empty() && conn.nickname.to_lowercase() == *lower);
            if let Some(conn) = conn {
                if let Err(err) = codec::write_frame(&mut conn.stream, message) {
                    logging::warn!(self.log, "group send failed, skipping recipient";
                                   "nickname" => lower.as_str(), "error" => %err);
                }
            }
        }
    }

    /// Mark a connection for teardown. The event loop sweeps the list once
    /// per iteration and performs the actual deregister-and-close.
    pub fn mark_for_removal(&self, id: ClientId) {
        let mut pending = self.pending.lock();
        if !pending.contains(&id) {
            pending.push(id);
        }
    }

    /// Drain the pending-removal list.
    pub fn drain_pending(&self) -> Vec<ClientId> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Drop every remaining connection, closing the sockets. Used during
    /// graceful shutdown. Returns how many were closed.
    pub fn clear_all(&self) -> usize {
        let mut map = self.clients.lock();
        let count = map.connections.len();
        map.connections.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{loopback_pair, read_frame, test_logger};
    use std::io::Read;

    fn registry_with_pair() -> (ClientRegistry, ClientId, std::net::TcpStream) {
        let registry = ClientRegistry::new(&test_logger());
        let (server_side, client_side) = loopback_pair();
        let id = registry.insert(server_side, "127.0.0.1:9".to_string());
        (registry, id, client_side)
    }

    #[test]
    fn test_insert_issues_unique_ids() {
        let registry = ClientRegistry::new(&test_logger());
        let (a, _ka) = loopback_pair();
        let (b, _kb) = loopback_pair();

        let first = registry.insert(a, "127.0.0.1:1".to_string());
        let second = registry.insert(b, "127.0.0.1:2".to_string());

        assert_ne!(first, second);
        assert_eq!(registry.snapshot_ids().len(), 2);
    }

    #[test]
    fn test_ids_are_not_reused_after_removal() {
        let registry = ClientRegistry::new(&test_logger());
        let (a, _ka) = loopback_pair();
        let first = registry.insert(a, "127.0.0.1:1".to_string());
        registry.remove(first);

        let (b, _kb) = loopback_pair();
        let second = registry.insert(b, "127.0.0.1:2".to_string());

        assert_ne!(first, second);
    }

    #[test]
    fn test_claim_nickname_rejects_duplicates() {
        let registry = ClientRegistry::new(&test_logger());
        let (a, _ka) = loopback_pair();
        let (b, _kb) = loopback_pair();
        let first = registry.insert(a, "127.0.0.1:1".to_string());
        let second = registry.insert(b, "127.0.0.1:2".to_string());

        assert!(registry.claim_nickname(first, "Alice", false));
        assert!(!registry.claim_nickname(second, "Alice", false));
        assert_eq!(registry.nickname_of(second), Some(String::new()));
    }

    #[test]
    fn test_claim_nickname_copies_admin_flag() {
        let (registry, id, _keep) = registry_with_pair();

        assert!(registry.claim_nickname(id, "root", true));

        assert!(registry.admin_flag(id));
    }

    #[test]
    fn test_find_by_raw_is_exact_and_lower_is_folded() {
        let (registry, id, _keep) = registry_with_pair();
        registry.claim_nickname(id, "Alice", false);

        assert_eq!(registry.find_by_raw_nickname("Alice"), Some(id));
        assert_eq!(registry.find_by_raw_nickname("alice"), None);
        assert_eq!(registry.find_by_lower_nickname("alice"), Some(id));
    }

    #[test]
    fn test_named_snapshot_skips_unauthenticated() {
        let registry = ClientRegistry::new(&test_logger());
        let (a, _ka) = loopback_pair();
        let (b, _kb) = loopback_pair();
        let first = registry.insert(a, "127.0.0.1:1".to_string());
        let _second = registry.insert(b, "127.0.0.1:2".to_string());
        registry.claim_nickname(first, "Alice", false);

        let snapshot = registry.named_snapshot();

        assert_eq!(snapshot, vec![(first, "Alice".to_string())]);
    }

    #[test]
    fn test_mark_and_drain_pending() {
        let (registry, id, _keep) = registry_with_pair();

        registry.mark_for_removal(id);
        registry.mark_for_removal(id);

        assert_eq!(registry.drain_pending(), vec![id]);
        assert!(registry.drain_pending().is_empty());
    }

    #[test]
    fn test_send_to_writes_frame() {
        let (registry, id, mut client_side) = registry_with_pair();

        assert!(registry.send_to(id, "欢迎"));

        assert_eq!(read_frame(&mut client_side), "欢迎");
    }

    #[test]
    fn test_send_to_unknown_handle_is_false() {
        let registry = ClientRegistry::new(&test_logger());

        assert!(!registry.send_to(42, "nobody home"));
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let registry = ClientRegistry::new(&test_logger());
        let (a, mut ka) = loopback_pair();
        let (b, mut kb) = loopback_pair();
        let first = registry.insert(a, "127.0.0.1:1".to_string());
        let _second = registry.insert(b, "127.0.0.1:2".to_string());

        registry.broadcast("hello room", Some(first));

        assert_eq!(read_frame(&mut kb), "hello room");
        ka.set_read_timeout(Some(std::time::Duration::from_millis(100))).unwrap();
        let mut probe = [0u8; 1];
        assert!(ka.read(&mut probe).is_err(), "sender must not receive its own broadcast");
    }

    #[test]
    fn test_send_to_lower_names_skips_offline() {
        let (registry, id, mut client_side) = registry_with_pair();
        registry.claim_nickname(id, "Alice", false);

        let names = vec!["alice".to_string(), "ghost".to_string()];
        registry.send_to_lower_names(&names, "[club]Alice: hi\n");

        assert_eq!(read_frame(&mut client_side), "[club]Alice: hi\n");
    }

    #[test]
    fn test_idle_ids_respects_threshold() {
        let (registry, id, _keep) = registry_with_pair();
        let now = Instant::now();

        assert!(registry.idle_ids(Duration::from_secs(300), now).is_empty());

        let later = now + Duration::from_secs(301);
        assert_eq!(registry.idle_ids(Duration::from_secs(300), later), vec![id]);
    }

    #[test]
    fn test_touch_defers_idle_expiry() {
        let (registry, id, _keep) = registry_with_pair();

        registry.touch(id);
        let later = Instant::now() + Duration::from_secs(299);

        assert!(registry.idle_ids(Duration::from_secs(300), later).is_empty());
    }

    #[test]
    fn test_remove_closes_socket() {
        let (registry, id, mut client_side) = registry_with_pair();

        let conn = registry.remove(id);
        drop(conn);

        let mut probe = [0u8; 1];
        assert_eq!(client_side.read(&mut probe).unwrap(), 0, "peer should observe EOF");
    }
}
