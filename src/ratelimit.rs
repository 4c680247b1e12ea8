//! Per-source-prefix admission control for handshake initiations
//!
//! Under load, each admitted initiation is charged against a token
//! bucket keyed by the source prefix: the full address for IPv4, the
//! /64 for IPv6. Tokens are durations, so accrual is simply the
//! monotonic time elapsed since the last initiation, capped at the
//! burst allowance. Idle entries are swept by a garbage-collection
//! worker that runs while the table is non-empty.

use std::hash::Hasher;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::OsRng;
use rand::RngCore;
use siphasher::sip::SipHasher13;

use crate::error::InitError;

/// Number of buckets in each rate-limit table
const RATELIMIT_SIZE: usize = 1 << 13;

/// Cap on live entries in one table
const RATELIMIT_SIZE_MAX: usize = RATELIMIT_SIZE * 8;

const INITIATIONS_PER_SECOND: u64 = 20;
const INITIATIONS_BURSTABLE: u64 = 5;

const INITIATION_COST_NANOS: u64 = 1_000_000_000 / INITIATIONS_PER_SECOND;

/// Token cost of admitting one initiation
const INITIATION_COST: Duration = Duration::from_nanos(INITIATION_COST_NANOS);

/// Bucket capacity; grants a burst of [`INITIATIONS_BURSTABLE`]
const TOKEN_MAX: Duration = Duration::from_nanos(INITIATION_COST_NANOS * INITIATIONS_BURSTABLE);

/// Entries idle for longer than this are garbage collected
const ELEMENT_TIMEOUT: Duration = Duration::from_secs(1);

/// The bytes of a source address the limiter aggregates on: all four
/// for IPv4, the top eight (a /64) for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefix {
    V4([u8; 4]),
    V6([u8; 8]),
}

impl Prefix {
    fn new(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Prefix::V4(v4.octets()),
            IpAddr::V6(v6) => {
                let mut top = [0u8; 8];
                top.copy_from_slice(&v6.octets()[..8]);
                Prefix::V6(top)
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Prefix::V4(b) => b,
            Prefix::V6(b) => b,
        }
    }
}

struct Entry {
    prefix: Prefix,
    last_time: Instant,
    tokens: Duration,
}

struct Table {
    buckets: Box<[Vec<Entry>]>,
    num: usize,
    /// `Some` while a GC pass is pending; inserts never push an armed
    /// deadline back.
    gc_deadline: Option<Instant>,
    shutdown: bool,
}

impl Table {
    /// Evict idle entries, or every entry on `force`. Runs with the
    /// table lock held.
    fn collect(&mut self, force: bool) {
        if self.num == 0 {
            return;
        }

        let cutoff = Instant::now().checked_sub(ELEMENT_TIMEOUT);
        let mut removed = 0;
        for bucket in self.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|e| !force && cutoff.map_or(true, |cutoff| e.last_time >= cutoff));
            removed += before - bucket.len();
        }
        self.num -= removed;

        if removed > 0 {
            tracing::trace!(removed, remaining = self.num, "swept rate-limit table");
        }
    }
}

struct Shared {
    secret: [u8; 16],
    table: Mutex<Table>,
    gc_wakeup: Condvar,
}

/// Token-bucket rate limiter for one address family.
pub struct RateLimiter {
    shared: Arc<Shared>,
    gc: Option<thread::JoinHandle<()>>,
}

impl RateLimiter {
    /// Create an empty table with a fresh random SipHash key and start
    /// the GC worker.
    ///
    /// Fails only when the system refuses resources for the worker
    /// thread.
    pub fn new() -> Result<Self, InitError> {
        let mut secret = [0u8; 16];
        OsRng.fill_bytes(&mut secret);

        let buckets = (0..RATELIMIT_SIZE)
            .map(|_| Vec::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let shared = Arc::new(Shared {
            secret,
            table: Mutex::new(Table {
                buckets,
                num: 0,
                gc_deadline: None,
                shutdown: false,
            }),
            gc_wakeup: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let gc = thread::Builder::new()
            .name("ratelimit-gc".into())
            .spawn(move || gc_worker(&worker))?;

        Ok(Self {
            shared,
            gc: Some(gc),
        })
    }

    /// Charge one initiation from `ip`'s prefix against its bucket.
    /// Returns `true` when the initiation is admitted.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let prefix = Prefix::new(ip);
        let idx = siphash13(&self.shared.secret, prefix.bytes()) as usize & (RATELIMIT_SIZE - 1);

        let mut table = self.shared.table.lock();

        if let Some(entry) = table.buckets[idx].iter_mut().find(|e| e.prefix == prefix) {
            // Standard token bucket: elapsed time accrues as tokens,
            // capped at TOKEN_MAX; each admit costs INITIATION_COST.
            let now = Instant::now();
            let diff = now.duration_since(entry.last_time);
            entry.last_time = now;

            let tokens = (entry.tokens + diff).min(TOKEN_MAX);
            return if tokens >= INITIATION_COST {
                entry.tokens = tokens - INITIATION_COST;
                true
            } else {
                entry.tokens = tokens;
                false
            };
        }

        if table.num >= RATELIMIT_SIZE_MAX {
            tracing::trace!("rate-limit table full, refusing new source");
            return false;
        }

        table.buckets[idx].push(Entry {
            prefix,
            last_time: Instant::now(),
            tokens: TOKEN_MAX - INITIATION_COST,
        });
        table.num += 1;
        self.schedule_gc(&mut table);

        true
    }

    /// Number of live entries in the table.
    pub fn len(&self) -> usize {
        self.shared.table.lock().num
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arm the GC timer unless a pass is already pending.
    fn schedule_gc(&self, table: &mut Table) {
        if table.gc_deadline.is_none() {
            table.gc_deadline = Some(Instant::now() + ELEMENT_TIMEOUT);
            self.shared.gc_wakeup.notify_one();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        {
            let mut table = self.shared.table.lock();
            table.shutdown = true;
            table.collect(true);
            self.shared.gc_wakeup.notify_one();
        }
        if let Some(gc) = self.gc.take() {
            let _ = gc.join();
        }
    }
}

/// GC worker loop: parked while the table is empty, otherwise sweeps
/// every [`ELEMENT_TIMEOUT`] until it is. Takes the same lock as
/// [`RateLimiter::allow`].
fn gc_worker(shared: &Shared) {
    let mut table = shared.table.lock();
    loop {
        if table.shutdown {
            return;
        }
        match table.gc_deadline {
            None => shared.gc_wakeup.wait(&mut table),
            Some(deadline) => {
                if shared.gc_wakeup.wait_until(&mut table, deadline).timed_out() {
                    table.collect(false);
                    table.gc_deadline = (table.num > 0).then(|| Instant::now() + ELEMENT_TIMEOUT);
                }
            }
        }
    }
}

fn siphash13(key: &[u8; 16], data: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_key(key);
    hasher.write(data);
    hasher.finish()
}

/// The per-family rate limiters a responder consults under load.
pub struct RateLimiters {
    v4: RateLimiter,
    v6: RateLimiter,
}

impl RateLimiters {
    /// Bring up the IPv4 and IPv6 tables and their GC workers.
    pub fn new() -> Result<Self, InitError> {
        Ok(Self {
            v4: RateLimiter::new()?,
            v6: RateLimiter::new()?,
        })
    }

    /// Charge `ip` against the limiter for its address family.
    pub fn allow(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.v4.allow(ip),
            IpAddr::V6(_) => self.v6.allow(ip),
        }
    }
}
