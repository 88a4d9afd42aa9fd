//! Admission control
//!
//! Three independent bounds on work in flight:
//!
//! - **PermitPool**: a fixed number of permits; reads cost less than
//!   writes. An operation waits for its cost to become free and gives up
//!   with a retryable timeout.
//! - **LockTable**: per-FsId exclusive locks owned by a transaction,
//!   re-entrant for the owner and released all at once on commit/rollback.
//! - **ClientLimiter**: concurrently served clients, with a waiting room
//!   the size of the accept backlog. Clients beyond it are refused at once.
//!
//! Every grant is an RAII guard, so a client that goes away mid-operation
//! hands its permits back without help.

use filestore_common::config::{ServerConfig, ThrottleConfig};
use filestore_common::{Error, FsId, Result, Xid};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Kind of operation asking for permits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Admission statistics for monitoring
#[derive(Debug, Default)]
pub struct AdmissionStats {
    /// Grants made without waiting
    pub immediate: AtomicU64,
    /// Grants made after waiting
    pub waited: AtomicU64,
    /// Requests that timed out or were refused
    pub rejected: AtomicU64,
}

/// Fixed pool of read/write permits
#[derive(Debug)]
pub struct PermitPool {
    available: Mutex<u32>,
    released: Condvar,
    total: u32,
    read_cost: u32,
    write_cost: u32,
    timeout: Duration,
    stats: AdmissionStats,
}

impl PermitPool {
    #[must_use]
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            available: Mutex::new(config.max_permits),
            released: Condvar::new(),
            total: config.max_permits,
            read_cost: config.read_cost,
            write_cost: config.write_cost,
            timeout: config.lock_timeout(),
            stats: AdmissionStats::default(),
        }
    }

    #[must_use]
    pub const fn cost(&self, op: Operation) -> u32 {
        match op {
            Operation::Read => self.read_cost,
            Operation::Write => self.write_cost,
        }
    }

    /// Wait up to the configured timeout for permits
    pub fn acquire(&self, op: Operation) -> Result<Permit<'_>> {
        self.acquire_timeout(op, self.timeout)
    }

    pub fn acquire_timeout(&self, op: Operation, timeout: Duration) -> Result<Permit<'_>> {
        let cost = self.cost(op);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut available = self.available.lock();
        if *available >= cost {
            *available -= cost;
            self.stats.immediate.fetch_add(1, Ordering::Relaxed);
            return Ok(Permit { pool: self, cost });
        }
        while *available < cost {
            if self.released.wait_until(&mut available, deadline).timed_out() && *available < cost {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(Error::timeout(format!("{op:?} permit"), start.elapsed()));
            }
        }
        *available -= cost;
        self.stats.waited.fetch_add(1, Ordering::Relaxed);
        debug!(?op, waited_ms = start.elapsed().as_millis(), "permit granted after wait");
        Ok(Permit { pool: self, cost })
    }

    /// Take permits only if they are free right now
    pub fn try_acquire(&self, op: Operation) -> Option<Permit<'_>> {
        let cost = self.cost(op);
        let mut available = self.available.lock();
        if *available < cost {
            return None;
        }
        *available -= cost;
        self.stats.immediate.fetch_add(1, Ordering::Relaxed);
        Some(Permit { pool: self, cost })
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        *self.available.lock()
    }

    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub const fn stats(&self) -> &AdmissionStats {
        &self.stats
    }

    fn release(&self, cost: u32) {
        let mut available = self.available.lock();
        *available = (*available + cost).min(self.total);
        self.released.notify_all();
    }
}

/// Permits held until dropped
#[derive(Debug)]
pub struct Permit<'a> {
    pool: &'a PermitPool,
    cost: u32,
}

impl Permit<'_> {
    #[must_use]
    pub const fn cost(&self) -> u32 {
        self.cost
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.pool.release(self.cost);
    }
}

/// Per-FsId exclusive locks owned by transactions
#[derive(Debug)]
pub struct LockTable {
    owners: Mutex<HashMap<FsId, Xid>>,
    released: Condvar,
    timeout: Duration,
}

impl LockTable {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Lock `id` for `xid`. Returns true if this call took the lock and
    /// false if `xid` already held it.
    pub fn lock(&self, xid: Xid, id: &FsId) -> Result<bool> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut owners = self.owners.lock();
        loop {
            match owners.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(xid);
                    return Ok(true);
                }
                Entry::Occupied(slot) if *slot.get() == xid => return Ok(false),
                Entry::Occupied(_) => {}
            }
            if self.released.wait_until(&mut owners, deadline).timed_out() && owners.contains_key(id) {
                return Err(Error::timeout(format!("lock on {id}"), start.elapsed()));
            }
        }
    }

    #[must_use]
    pub fn owner(&self, id: &FsId) -> Option<Xid> {
        self.owners.lock().get(id).copied()
    }

    /// Drop every lock `xid` holds and return how many there were
    pub fn release_all(&self, xid: Xid) -> usize {
        let mut owners = self.owners.lock();
        let before = owners.len();
        owners.retain(|_, owner| *owner != xid);
        let released = before - owners.len();
        if released > 0 {
            self.released.notify_all();
        }
        released
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct Clients {
    active: u32,
    waiting: u32,
}

/// Bound on concurrently served clients
#[derive(Debug)]
pub struct ClientLimiter {
    clients: Mutex<Clients>,
    released: Condvar,
    max_active: u32,
    backlog: u32,
    timeout: Duration,
}

impl ClientLimiter {
    #[must_use]
    pub fn new(config: &ServerConfig, timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(Clients::default()),
            released: Condvar::new(),
            max_active: config.max_client_threads,
            backlog: config.accept_backlog,
            timeout,
        }
    }

    /// Admit a client, waiting for a free slot if the backlog has room
    pub fn admit(&self) -> Result<ClientSlot<'_>> {
        let start = Instant::now();
        let mut clients = self.clients.lock();
        if clients.active < self.max_active {
            clients.active += 1;
            return Ok(ClientSlot { limiter: self });
        }
        if clients.active + clients.waiting >= self.backlog {
            return Err(Error::timeout("client slot (backlog full)", Duration::ZERO));
        }
        clients.waiting += 1;
        let deadline = start + self.timeout;
        while clients.active >= self.max_active {
            if self.released.wait_until(&mut clients, deadline).timed_out()
                && clients.active >= self.max_active
            {
                clients.waiting -= 1;
                return Err(Error::timeout("client slot", start.elapsed()));
            }
        }
        clients.waiting -= 1;
        clients.active += 1;
        Ok(ClientSlot { limiter: self })
    }

    #[must_use]
    pub fn active(&self) -> u32 {
        self.clients.lock().active
    }

    fn release(&self) {
        let mut clients = self.clients.lock();
        clients.active = clients.active.saturating_sub(1);
        self.released.notify_one();
    }
}

/// A served client; frees its slot when dropped
#[derive(Debug)]
pub struct ClientSlot<'a> {
    limiter: &'a ClientLimiter,
}

impl Drop for ClientSlot<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
