use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, OnceCell};

use super::config::refill_threshold;
use crate::SegmentConfig;

/// One contiguous range `[max - step, max)` of a business key.
#[derive(Debug)]
struct Segment {
    /// Next value to hand out. Runs past `max` once exhausted; values at or
    /// beyond `max` are never returned.
    value: AtomicU64,
    max: u64,
    step: u64,
    /// Value whose issuance triggers the prefetch of the idle segment.
    refill_at: u64,
}

impl Segment {
    const fn empty() -> Self {
        Self {
            value: AtomicU64::new(0),
            max: 0,
            step: 0,
            refill_at: 0,
        }
    }

    fn new(max: u64, step: u64, threshold: u64) -> Self {
        let start = max - step;
        Self {
            value: AtomicU64::new(start),
            max,
            step,
            refill_at: start + threshold.saturating_sub(1),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.value.load(Ordering::Acquire) >= self.max
    }
}

#[derive(Debug)]
struct Slots {
    segments: [Segment; 2],
    current: usize,
    next_ready: bool,
}

#[derive(Debug)]
struct StepState {
    step: u64,
    last_refill: Option<Instant>,
}

/// Result of a synchronous issuance attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Issue {
    /// `refill` is set when this call claimed the prefetch of the idle slot.
    Id { id: u64, refill: bool },
    /// The current segment is used up and the idle one is not ready.
    Exhausted { refill: bool },
}

/// Point-in-time view of a [`SegmentBuffer`], for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferStats {
    pub key: String,
    /// Upper bound (exclusive) of the segment being served.
    pub current_max: u64,
    /// IDs left in the segment being served.
    pub remaining: u64,
    /// Step of the segment being served.
    pub step: u64,
    pub next_ready: bool,
    pub refilling: bool,
}

/// Double-buffered cache of ID ranges for one business key.
///
/// Readers hand out IDs from the current segment with an atomic increment
/// under a shared lock. Swapping to the idle segment and installing a freshly
/// fetched range both take the exclusive lock, so a reader that hits the end
/// of a segment while a refill lands sees either the old state or the
/// complete new one. At most one refill per buffer is in flight, claimed
/// through the `refilling` flag.
#[derive(Debug)]
pub struct SegmentBuffer {
    key: String,
    slots: RwLock<Slots>,
    pub(crate) loaded: OnceCell<()>,
    refilling: AtomicBool,
    step: Mutex<StepState>,
    failure: Mutex<Option<String>>,
    refilled: Notify,
    low_water: f64,
}

impl SegmentBuffer {
    pub(crate) fn new(key: impl Into<String>, step: u64, low_water: f64) -> Self {
        Self {
            key: key.into(),
            slots: RwLock::new(Slots {
                segments: [Segment::empty(), Segment::empty()],
                current: 0,
                next_ready: false,
            }),
            loaded: OnceCell::new(),
            refilling: AtomicBool::new(false),
            step: Mutex::new(StepState {
                step,
                last_refill: None,
            }),
            failure: Mutex::new(None),
            refilled: Notify::new(),
            low_water,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn make_segment(&self, max: u64, step: u64) -> Segment {
        Segment::new(max, step, refill_threshold(step, self.low_water))
    }

    /// Installs the first segment. Only called once, before any issuance.
    pub(crate) fn install_initial(&self, max: u64, step: u64) {
        let segment = self.make_segment(max, step);
        let mut slots = self.slots.write();
        let current = slots.current;
        slots.segments[current] = segment;
        drop(slots);

        let mut state = self.step.lock();
        state.step = step;
        state.last_refill = Some(Instant::now());
    }

    /// Hands out the next ID from the current segment, swapping to the idle
    /// segment when the current one runs out and the idle one is ready.
    pub(crate) fn try_issue(&self) -> Issue {
        loop {
            {
                let slots = self.slots.read();
                let segment = &slots.segments[slots.current];
                let id = segment.value.fetch_add(1, Ordering::AcqRel);
                if id < segment.max {
                    let refill =
                        id >= segment.refill_at && !slots.next_ready && self.begin_refill();
                    return Issue::Id { id, refill };
                }
            }

            let mut slots = self.slots.write();
            let current = slots.current;
            if !slots.segments[current].is_exhausted() {
                // Someone swapped while we waited for the lock.
                continue;
            }
            if !slots.next_ready {
                return Issue::Exhausted {
                    refill: self.begin_refill(),
                };
            }
            slots.current = 1 - current;
            slots.next_ready = false;
            #[cfg(feature = "tracing")]
            tracing::debug!(
                key = %self.key,
                max = slots.segments[slots.current].max,
                "switched to prefetched segment"
            );
        }
    }

    /// Claims the single refill slot. Returns `false` if a refill is already
    /// running.
    fn begin_refill(&self) -> bool {
        let claimed = self
            .refilling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            *self.failure.lock() = None;
        }
        claimed
    }

    /// Step the next refill should request.
    pub(crate) fn planned_step(&self, config: &SegmentConfig) -> u64 {
        let state = self.step.lock();
        config.adapt_step(state.step, state.last_refill.map(|at| at.elapsed()))
    }

    /// Installs a fetched range into the idle slot and wakes waiters.
    pub(crate) fn complete_refill(&self, max: u64, step: u64) {
        let segment = self.make_segment(max, step);
        {
            let mut slots = self.slots.write();
            let idle = 1 - slots.current;
            slots.segments[idle] = segment;
            slots.next_ready = true;
        }
        {
            let mut state = self.step.lock();
            state.step = step;
            state.last_refill = Some(Instant::now());
        }
        self.refilling.store(false, Ordering::Release);
        self.refilled.notify_waiters();
    }

    /// Records a refill that gave up and wakes waiters.
    pub(crate) fn fail_refill(&self, reason: String) {
        *self.failure.lock() = Some(reason);
        self.refilling.store(false, Ordering::Release);
        self.refilled.notify_waiters();
    }

    pub fn is_refilling(&self) -> bool {
        self.refilling.load(Ordering::Acquire)
    }

    pub fn is_next_ready(&self) -> bool {
        self.slots.read().next_ready
    }

    /// Reason the last refill gave up, if it did and no refill has started
    /// since.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Waits until no refill is in flight or `deadline` passes. Returns
    /// `false` on timeout.
    pub(crate) async fn wait_for_refill(&self, deadline: tokio::time::Instant) -> bool {
        let notified = self.refilled.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a completion in between is not
        // missed.
        notified.as_mut().enable();
        if !self.is_refilling() {
            return true;
        }
        tokio::time::timeout_at(deadline, notified).await.is_ok()
    }

    pub fn stats(&self) -> BufferStats {
        let slots = self.slots.read();
        let segment = &slots.segments[slots.current];
        let value = segment.value.load(Ordering::Acquire);
        BufferStats {
            key: self.key.clone(),
            current_max: segment.max,
            remaining: segment.max.saturating_sub(value),
            step: segment.step,
            next_ready: slots.next_ready,
            refilling: self.is_refilling(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(max: u64, step: u64) -> SegmentBuffer {
        let buffer = SegmentBuffer::new("k", step, 0.9);
        buffer.install_initial(max, step);
        buffer
    }

    #[test]
    fn issues_current_range_in_order() {
        let buffer = loaded(10, 10);
        let ids: Vec<_> = (0..10)
            .map(|_| match buffer.try_issue() {
                Issue::Id { id, .. } => id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn claims_refill_once_at_low_water() {
        let buffer = loaded(10, 10);
        let claims: Vec<_> = (0..10)
            .map(|_| match buffer.try_issue() {
                Issue::Id { refill, .. } => refill,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // 90% of 10: the ninth ID claims the refill, nobody else does.
        let mut expected = vec![false; 10];
        expected[8] = true;
        assert_eq!(claims, expected);
        assert!(buffer.is_refilling());
    }

    #[test]
    fn reports_exhaustion_until_refill_lands() {
        // Step 2 at 90% floors to a threshold of one: the first ID prefetches.
        let buffer = loaded(2, 2);
        assert!(matches!(buffer.try_issue(), Issue::Id { id: 0, refill: true }));
        assert!(matches!(buffer.try_issue(), Issue::Id { id: 1, refill: false }));
        // Refill already claimed, so the exhausted caller does not claim it.
        assert_eq!(buffer.try_issue(), Issue::Exhausted { refill: false });

        buffer.complete_refill(6, 4);
        assert!(buffer.is_next_ready());
        assert!(matches!(buffer.try_issue(), Issue::Id { id: 2, .. }));
        assert!(!buffer.is_next_ready());
        assert_eq!(buffer.stats().current_max, 6);
        assert_eq!(buffer.stats().remaining, 3);
    }

    #[test]
    fn exhausted_caller_claims_refill_after_failure() {
        let buffer = loaded(1, 1);
        assert!(matches!(buffer.try_issue(), Issue::Id { id: 0, refill: true }));
        buffer.fail_refill("store down".to_owned());
        assert_eq!(buffer.failure().as_deref(), Some("store down"));

        assert_eq!(buffer.try_issue(), Issue::Exhausted { refill: true });
        // A new attempt clears the old failure.
        assert_eq!(buffer.failure(), None);
    }

    #[test]
    fn planned_step_adapts_from_last_refill() {
        let config = SegmentConfig {
            default_step: 10,
            min_step: 10,
            max_step: 40,
            ..SegmentConfig::default()
        };
        let buffer = loaded(10, 10);
        // The first segment was just installed, well inside the target
        // interval.
        assert_eq!(buffer.planned_step(&config), 20);
        buffer.complete_refill(30, 20);
        assert_eq!(buffer.planned_step(&config), 40);
    }
}
