//! Idle, authenticated server connections kept for reuse.
//!
//! Entries are grouped by the username the socket authenticated as; the
//! default database is deliberately not part of the key, since a reused
//! socket is realigned with `COM_INIT_DB` or `COM_CHANGE_USER`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::net::Socket;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Above this many idle connections for some user, another user may
    /// borrow one and re-authenticate it.
    pub min_idle_connections: usize,

    /// Per-user cap; a returning connection past the cap is closed.
    pub max_idle_connections: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_idle_connections: 0,
            max_idle_connections: 8,
        }
    }
}

struct IdleEntry {
    id: u64,
    // `Option` so the socket can be claimed back out from under the
    // `Drop` impl
    socket: Option<Socket>,
    #[allow(dead_code)]
    added_at: Instant,
    watchdog: Option<JoinHandle<()>>,
}

impl Drop for IdleEntry {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

#[derive(Default)]
struct PoolInner {
    users: HashMap<String, VecDeque<IdleEntry>>,
    next_id: u64,
}

impl PoolInner {
    fn remove_by_id(&mut self, username: &str, id: u64) -> Option<IdleEntry> {
        let queue = self.users.get_mut(username)?;
        let pos = queue.iter().position(|e| e.id == id)?;
        let entry = queue.remove(pos);

        if queue.is_empty() {
            self.users.remove(username);
        }

        entry
    }
}

/// One backend's cache of idle server sockets.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
    options: PoolOptions,
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            options,
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();

        inner.users.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park a post-auth, quiet socket for reuse.
    ///
    /// The socket is watched for readability: an idle server has nothing
    /// to say, so any event means the peer hung up (or worse) and the
    /// entry is evicted and closed. Returns `false`, dropping the
    /// socket, when the user's queue is full or the socket has no
    /// authenticated identity.
    pub fn add(&self, socket: Socket) -> bool {
        debug_assert!(socket.is_quiet(), "pooled socket with queued bytes");

        let Some(username) = socket.username().map(str::to_owned) else {
            return false;
        };

        let mut inner = self.inner.lock().unwrap();

        let queue = inner.users.entry(username.clone()).or_default();
        if queue.len() >= self.options.max_idle_connections {
            tracing::debug!(user = %username, "idle pool full, closing returned connection");
            return false;
        }

        inner.next_id += 1;
        let id = inner.next_id;

        let stream = socket.stream_handle();
        let pool = Arc::clone(&self.inner);
        let watch_user = username.clone();

        let watchdog = tokio::spawn(async move {
            // an idle server socket only becomes readable to announce a
            // shutdown packet or a straight close
            let _ = stream.readable().await;

            let mut inner = pool.lock().unwrap();
            if inner.remove_by_id(&watch_user, id).is_some() {
                tracing::debug!(user = %watch_user, "evicting idle connection on peer event");
            }
        });

        inner
            .users
            .get_mut(&username)
            .expect("entry inserted above")
            .push_back(IdleEntry {
                id,
                socket: Some(socket),
                added_at: Instant::now(),
                watchdog: Some(watchdog),
            });

        true
    }

    /// Hand out an idle socket for `username`.
    ///
    /// Prefers a same-user entry; failing that, borrows from a user
    /// holding more than `min_idle_connections` so the caller can
    /// re-authenticate it with `COM_CHANGE_USER`. The returned flag is
    /// `true` when the identity already matches.
    pub fn get(&self, username: &str) -> Option<(Socket, bool)> {
        loop {
            let (entry, same_user) = {
                let mut inner = self.inner.lock().unwrap();

                if let Some(queue) = inner.users.get_mut(username) {
                    let entry = queue.pop_front();
                    if queue.is_empty() {
                        inner.users.remove(username);
                    }

                    match entry {
                        Some(entry) => (entry, true),
                        None => return None,
                    }
                } else {
                    let donor = inner
                        .users
                        .iter()
                        .find(|(user, queue)| {
                            *user != username && queue.len() > self.options.min_idle_connections
                        })
                        .map(|(user, _)| user.clone())?;

                    let queue = inner.users.get_mut(&donor).expect("donor looked up above");
                    let entry = queue.pop_front().expect("donor queue non-empty");
                    if queue.is_empty() {
                        inner.users.remove(&donor);
                    }

                    (entry, false)
                }
            };

            if let Some(socket) = claim(entry) {
                return Some((socket, same_user));
            }

            // raced an eviction; try the next entry
        }
    }

    /// Drop every idle entry, closing the sockets.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.clear();
    }
}

/// Stop the watchdog and double-check the socket is still silent; a
/// byte (or a close) that raced the checkout poisons the entry.
fn claim(mut entry: IdleEntry) -> Option<Socket> {
    if let Some(watchdog) = entry.watchdog.take() {
        watchdog.abort();
    }

    let socket = entry.socket.take()?;

    let mut probe = [0u8; 1];
    match socket.stream().try_read(&mut probe) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(socket),

        // data, close, or a hard error: not reusable
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionPool, PoolOptions};
    use crate::net::{Socket, Stream};
    use crate::protocol::connect::AuthResponse;
    use crate::protocol::Capabilities;

    async fn authed_socket(username: &str) -> (Socket, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut socket = Socket::new(Stream::Tcp(client));
        socket.response = Some(AuthResponse {
            capabilities: Capabilities::base(),
            max_packet_size: 0x0100_0000,
            charset: 8,
            username: username.into(),
            scramble: vec![0; 20],
            database: None,
            auth_plugin: None,
        });
        socket.set_authed(true);

        (socket, server)
    }

    #[tokio::test]
    async fn it_prefers_the_matching_user() {
        let pool = ConnectionPool::new(PoolOptions::default());

        let (root, _peer_root) = authed_socket("root").await;
        let (app, _peer_app) = authed_socket("app").await;

        assert!(pool.add(root));
        assert!(pool.add(app));
        assert_eq!(pool.len(), 2);

        let (socket, same_user) = pool.get("app").unwrap();
        assert!(same_user);
        assert_eq!(socket.username(), Some("app"));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn it_borrows_across_users_above_the_idle_floor() {
        let pool = ConnectionPool::new(PoolOptions {
            min_idle_connections: 1,
            max_idle_connections: 8,
        });

        let (a, _peer_a) = authed_socket("root").await;
        let (b, _peer_b) = authed_socket("root").await;
        assert!(pool.add(a));
        assert!(pool.add(b));

        // two idle "root" sockets > floor of one: a stranger may borrow
        let (socket, same_user) = pool.get("app").unwrap();
        assert!(!same_user);
        assert_eq!(socket.username(), Some("root"));

        // the floor now blocks further borrowing
        assert!(pool.get("app").is_none());
    }

    #[tokio::test]
    async fn it_caps_idle_connections_per_user() {
        let pool = ConnectionPool::new(PoolOptions {
            min_idle_connections: 0,
            max_idle_connections: 1,
        });

        let (a, _peer_a) = authed_socket("root").await;
        let (b, _peer_b) = authed_socket("root").await;

        assert!(pool.add(a));
        assert!(!pool.add(b));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn it_evicts_when_the_peer_hangs_up() {
        let pool = ConnectionPool::new(PoolOptions::default());

        let (socket, peer) = authed_socket("root").await;
        assert!(pool.add(socket));

        drop(peer);

        // the watchdog runs on readability; give it a beat
        for _ in 0..50 {
            if pool.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(pool.is_empty());
        assert!(pool.get("root").is_none());
    }
}
