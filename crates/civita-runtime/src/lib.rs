#![forbid(unsafe_code)]

//! Process-wide services shared by every civita tensor: a logical clock for
//! cache staleness, a cooperative cancellation flag, and an allocation
//! accountant bounding the bytes held by core-owned buffers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    OutOfMemory { requested: usize, budget: usize },
    Cancelled,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, budget } => {
                write!(
                    f,
                    "allocation denied: requested={requested} bytes over budget={budget} bytes"
                )
            }
            Self::Cancelled => write!(f, "computation cancelled"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// A reading of the process-wide logical clock. Strictly increasing across
/// calls to [`now`], so two mutations can never share a stamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Earlier than any stamp ever issued by [`now`].
    pub const EPOCH: Timestamp = Timestamp(0);

    #[must_use]
    pub fn ticks(self) -> u64 {
        self.0
    }

    /// Rebuild a stamp from its tick count, e.g. after parking it in an
    /// atomic.
    #[must_use]
    pub fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }
}

static CLOCK: AtomicU64 = AtomicU64::new(1);

#[must_use]
pub fn now() -> Timestamp {
    Timestamp(CLOCK.fetch_add(1, Ordering::Relaxed))
}

static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Request (or with `false`, withdraw) cancellation of all in-flight
/// computations in the process. Long loops observe the flag via
/// [`check_cancel`]; the flag stays set until explicitly reset.
pub fn cancel(value: bool) {
    CANCELLED.store(value, Ordering::Relaxed);
}

pub fn check_cancel() -> Result<(), RuntimeError> {
    if CANCELLED.load(Ordering::Relaxed) {
        debug!("cancellation flag observed");
        return Err(RuntimeError::Cancelled);
    }
    Ok(())
}

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
// 0 means "not yet derived from physical memory".
static BUDGET: AtomicUsize = AtomicUsize::new(0);

/// Fraction of physical memory the accountant hands out before denying
/// further growth. Empirically keeps the host out of swap.
const BUDGET_FRACTION: f64 = 0.6;

#[cfg(target_os = "linux")]
fn physical_memory() -> usize {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return usize::MAX;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            if let Some(kb) = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<usize>().ok())
            {
                return kb.saturating_mul(1024);
            }
        }
    }
    usize::MAX
}

#[cfg(not(target_os = "linux"))]
fn physical_memory() -> usize {
    usize::MAX
}

fn budget_bytes() -> usize {
    let current = BUDGET.load(Ordering::Relaxed);
    if current != 0 {
        return current;
    }
    let physical = physical_memory();
    let derived = if physical == usize::MAX {
        usize::MAX
    } else {
        (physical as f64 * BUDGET_FRACTION) as usize
    };
    BUDGET.store(derived, Ordering::Relaxed);
    derived
}

/// Override the allocation budget (bytes). Intended for embedders and tests
/// that need deterministic denial.
pub fn set_budget_bytes(bytes: usize) {
    BUDGET.store(bytes, Ordering::Relaxed);
}

/// Forget any override; the next accounting call re-derives the budget from
/// physical memory.
pub fn reset_budget() {
    BUDGET.store(0, Ordering::Relaxed);
}

#[must_use]
pub fn allocated_bytes() -> usize {
    ALLOCATED.load(Ordering::Relaxed)
}

/// Record a change in the bytes held by core-owned buffers. A positive delta
/// that would push the total above the budget is denied without updating the
/// counter; a negative delta clamps the counter at zero.
pub fn track_allocation(delta: isize) -> Result<(), RuntimeError> {
    if delta >= 0 {
        let requested = delta.unsigned_abs();
        let budget = budget_bytes();
        let mut current = ALLOCATED.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(requested);
            if next > budget {
                warn!(requested, budget, held = current, "allocation denied");
                return Err(RuntimeError::OutOfMemory { requested, budget });
            }
            match ALLOCATED.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    } else {
        let released = delta.unsigned_abs();
        let mut current = ALLOCATED.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(released);
            match ALLOCATED.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}
