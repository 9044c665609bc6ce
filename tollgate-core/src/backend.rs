//! The set of upstream MySQL servers the proxy balances over.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::net::NetworkAddress;
use crate::pool::{ConnectionPool, PoolOptions};

/// How long a backend stays `Down` before the self-check gives it
/// another chance as `Unknown`.
const DOWN_GRACE: Duration = Duration::from_secs(4);

/// The self-check runs at most this often.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Rw,
    Ro,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unknown,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
struct Health {
    state: BackendState,
    since: Instant,
}

/// One upstream server: immutable address and role, mutable health, a
/// checked-out-connection counter, and the idle cache.
pub struct Backend {
    pub addr: NetworkAddress,
    pub kind: BackendKind,
    pub pool: ConnectionPool,

    health: Mutex<Health>,
    connected_clients: AtomicUsize,
}

impl Backend {
    fn new(addr: NetworkAddress, kind: BackendKind, pool_options: PoolOptions) -> Self {
        Self {
            addr,
            kind,
            pool: ConnectionPool::new(pool_options),
            health: Mutex::new(Health {
                state: BackendState::Unknown,
                since: Instant::now(),
            }),
            connected_clients: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> BackendState {
        self.health.lock().unwrap().state
    }

    pub fn state_since(&self) -> Instant {
        self.health.lock().unwrap().since
    }

    pub fn set_state(&self, state: BackendState) {
        let mut health = self.health.lock().unwrap();

        if health.state != state {
            health.state = state;
            health.since = Instant::now();
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Acquire)
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::AcqRel);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("addr", &self.addr.to_string())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("connected_clients", &self.connected_clients())
            .finish()
    }
}

/// All configured backends. Registration happens at startup; health and
/// counters change throughout.
pub struct BackendRegistry {
    backends: Mutex<Vec<Arc<Backend>>>,
    last_check: Mutex<Instant>,
    pool_options: PoolOptions,
}

impl BackendRegistry {
    pub fn new(pool_options: PoolOptions) -> Self {
        Self {
            backends: Mutex::new(Vec::new()),
            // allow the first check to run immediately
            last_check: Mutex::new(Instant::now() - CHECK_INTERVAL),
            pool_options,
        }
    }

    /// Register a backend. The canonical address is the duplicate key:
    /// `127.0.0.1` and `127.0.0.1:3306` collide.
    pub fn add(&self, addr: NetworkAddress, kind: BackendKind) -> Result<()> {
        let mut backends = self.backends.lock().unwrap();

        let canonical = addr.to_string();
        if backends.iter().any(|b| b.addr.to_string() == canonical) {
            return Err(Error::DuplicateBackend(canonical));
        }

        backends.push(Arc::new(Backend::new(addr, kind, self.pool_options)));

        Ok(())
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.backends.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Give long-down backends another chance. Rate-limited to once per
    /// second; extra calls are free no-ops.
    pub fn check_wakeup(&self) {
        {
            let mut last = self.last_check.lock().unwrap();
            if last.elapsed() < CHECK_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        for backend in self.backends.lock().unwrap().iter() {
            if backend.state() != BackendState::Down {
                continue;
            }

            if backend.state_since().elapsed() > DOWN_GRACE {
                tracing::debug!(backend = %backend.addr, "backend was down long enough, waking it up");
                backend.set_state(BackendState::Unknown);
            }
        }
    }

    /// The writable backend with the fewest checked-out connections,
    /// skipping anything marked `Down`.
    pub fn pick_rw(&self) -> Option<Arc<Backend>> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.kind == BackendKind::Rw && b.state() != BackendState::Down)
            .min_by_key(|b| b.connected_clients())
            .cloned()
    }

    /// Total checked-out connections across all backends.
    pub fn total_connected(&self) -> usize {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.connected_clients())
            .sum()
    }
}
