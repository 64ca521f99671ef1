//! Pacer, the clock that drives the whole pipeline.
//!
//! The pacer hands out [`SequenceIndex`] values `0, 1, 2, …` no faster than
//! the configured [`RateSpec`] allows and never more than `K` ahead of the
//! downstream work, where `K` is the number of permits in the shared
//! in-flight semaphore.
//!
//! # Schedule
//!
//! Time is cut into one second windows and the `r` emissions of a window are
//! spread evenly across it instead of being released at the window boundary.
//! The deadline of emission `n` is computed from the start instant and `n`
//! alone:
//!
//! ```text
//! window  = n / r
//! slot    = n % r
//! offset  = window * 1s + (slot * 1s) / r
//! ```
//!
//! Because every deadline is absolute, rounding never accumulates from one
//! tick to the next, and when `1s / r` is not a whole number of nanoseconds
//! the remainder shows up in later slots instead of being dropped. Over any
//! `N` second span exactly `r * N` (±1) deadlines fall due.
//!
//! # Backpressure
//!
//! Once a deadline has passed the pacer still has to acquire a permit from the
//! in-flight semaphore. The permit travels inside the [`Emission`] and goes
//! back to the semaphore when the emission is dropped, which the worker does
//! after the event was published or given up on. A slow sink therefore
//! suspends the pacer instead of letting emissions pile up. After a stall the
//! schedule is not reset: overdue emissions go out as fast as permits free up.

use std::{fmt, num::NonZeroU64, sync::Arc, time::Duration};

use futures::Stream;
use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::config::RateSpec;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Position of an event in the run. Starts at zero and grows by one per emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SequenceIndex(u64);

impl SequenceIndex {
    pub const ZERO: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Offset of emission `index` from the start of the run.
pub fn emission_offset(index: u64, events_per_second: NonZeroU64) -> Duration {
    let rate = events_per_second.get();
    let window = index / rate;
    let slot = index % rate;
    // slot < rate, so this is always below one second
    let slot_nanos = (u128::from(slot) * NANOS_PER_SEC) / u128::from(rate);
    Duration::from_secs(window).saturating_add(Duration::from_nanos(slot_nanos as u64))
}

/// One scheduled index together with its in-flight permit.
///
/// Dropping the emission acknowledges it and lets the pacer move on.
#[derive(Debug)]
pub struct Emission {
    index: SequenceIndex,
    scheduled_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Emission {
    pub fn index(&self) -> SequenceIndex {
        self.index
    }

    /// The deadline this emission was scheduled for.
    pub fn scheduled_at(&self) -> Instant {
        self.scheduled_at
    }

    /// How far behind schedule the emission went out.
    pub fn lag(&self) -> Duration {
        Instant::now().saturating_duration_since(self.scheduled_at)
    }
}

pub struct Pacer {
    rate: RateSpec,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    start: Option<Instant>,
    next: u64,
}

impl Pacer {
    /// The clock starts on the first call to [`Pacer::next`].
    pub fn new(rate: RateSpec, permits: Arc<Semaphore>, cancel: CancellationToken) -> Self {
        Self {
            rate,
            permits,
            cancel,
            start: None,
            next: 0,
        }
    }

    /// Number of indices handed out so far.
    pub fn emitted(&self) -> u64 {
        self.next
    }

    /// Waits for the next deadline and a free permit.
    ///
    /// Returns `None` once cancelled; after that it keeps returning `None`.
    pub async fn next(&mut self) -> Option<Emission> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let start = *self.start.get_or_insert_with(Instant::now);
        let deadline = start + emission_offset(self.next, self.rate.events_per_second());

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    tracing::debug!("In-flight semaphore closed, pacer stopping.");
                    return None;
                }
            },
        };

        let index = SequenceIndex(self.next);
        self.next += 1;
        Some(Emission {
            index,
            scheduled_at: deadline,
            _permit: permit,
        })
    }

    /// The pacer as a lazy, infinite stream of emissions.
    pub fn into_stream(self) -> impl Stream<Item = Emission> + Send {
        futures::stream::unfold(self, |mut pacer| async move {
            pacer.next().await.map(|emission| (emission, pacer))
        })
    }
}
