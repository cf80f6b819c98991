use crate::logging::{info, Logger};
use crate::net::shared::Protocol;
use crate::net::timer::TimeoutClass;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Per-service counters, shared between the reactor thread (which updates
/// them) and the statistics reporter (which reads them with relaxed
/// ordering). Cumulative counters reset on every report; `active_tunnels`
/// is a gauge and is only sampled.
pub struct ServiceStats {
    pub label: String,
    pub protocol: Protocol,
    pub active_tunnels: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub bytes_south_north: AtomicU64,
    pub bytes_north_south: AtomicU64,
    pub timeout_connect: AtomicU64,
    pub timeout_established: AtomicU64,
    pub timeout_broken: AtomicU64,
    pub timeout_idle: AtomicU64,
}

impl ServiceStats {
    pub fn new(label: String, protocol: Protocol) -> Arc<ServiceStats> {
        Arc::new(ServiceStats {
            label,
            protocol,
            active_tunnels: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            bytes_south_north: AtomicU64::new(0),
            bytes_north_south: AtomicU64::new(0),
            timeout_connect: AtomicU64::new(0),
            timeout_established: AtomicU64::new(0),
            timeout_broken: AtomicU64::new(0),
            timeout_idle: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn timeout_counter(&self, class: TimeoutClass) -> &AtomicU64 {
        match class {
            TimeoutClass::Connect => &self.timeout_connect,
            TimeoutClass::Established => &self.timeout_established,
            TimeoutClass::Broken => &self.timeout_broken,
            TimeoutClass::Idle => &self.timeout_idle,
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

/// Arena usage gauges, re-sampled by the reporter.
pub struct ArenaGauges {
    pub in_use_bytes: AtomicU64,
    pub free_bytes: AtomicU64,
    pub in_use_blocks: AtomicU64,
}

impl ArenaGauges {
    pub fn new() -> ArenaGauges {
        ArenaGauges {
            in_use_bytes: AtomicU64::new(0),
            free_bytes: AtomicU64::new(0),
            in_use_blocks: AtomicU64::new(0),
        }
    }
}

#[inline]
fn take(counter: &AtomicU64) -> u64 {
    counter.swap(0, Ordering::Relaxed)
}

/// Statistics loop: sleeps in short slices so shutdown is prompt, and once
/// per interval emits one summary line per service plus the arena usage,
/// resetting the cumulative counters afterwards.
pub fn run_reporter(
    log: &Logger,
    interval: Duration,
    stop: &AtomicBool,
    services: &[Arc<ServiceStats>],
    arena: &ArenaGauges,
) {
    const SLICE: Duration = Duration::from_millis(100);

    let mut slept = Duration::from_secs(0);

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(SLICE);
        slept += SLICE;

        if slept < interval {
            continue;
        }
        slept = Duration::from_secs(0);

        for stats in services {
            info!(log, "service statistics";
                  "service" => %stats.label,
                  "protocol" => %stats.protocol,
                  "active_tunnels" => stats.active_tunnels.load(Ordering::Relaxed),
                  "accepted" => take(&stats.accepted),
                  "rejected" => take(&stats.rejected),
                  "bytes_south_north" => take(&stats.bytes_south_north),
                  "bytes_north_south" => take(&stats.bytes_north_south),
                  "timeout_connect" => take(&stats.timeout_connect),
                  "timeout_established" => take(&stats.timeout_established),
                  "timeout_broken" => take(&stats.timeout_broken),
                  "timeout_idle" => take(&stats.timeout_idle));
        }

        info!(log, "arena usage";
              "in_use_bytes" => arena.in_use_bytes.load(Ordering::Relaxed),
              "free_bytes" => arena.free_bytes.load(Ordering::Relaxed),
              "in_use_blocks" => arena.in_use_blocks.load(Ordering::Relaxed));
    }
}
