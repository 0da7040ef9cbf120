//! Adaptive generation sizing
//!
//! Fed with the timing of every pause and the mutator interval before it,
//! the policy keeps padded moving averages of pause length and of GC cost
//! (`pause / (pause + interval)`) and recommends young and old generation
//! sizes for the next cycle. Goals are checked in priority order:
//!
//! 1. pause time: shrink the generation whose padded pause exceeds the goal
//! 2. throughput: grow both generations, weighted by their share of GC cost
//! 3. footprint: shrink when every other goal is met
//!
//! Nothing here affects correctness; a bad recommendation only costs time or
//! memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::averages::{AdaptivePaddedAverage, AdaptiveWeightedAverage, LinearLeastSquareFit};
use crate::config::SizingConfig;

// ---------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed epoch
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Clock whose epoch is now
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------

/// Why a collection happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// An allocation did not fit
    AllocationFailure,
    /// A young collection could not promote everything
    PromotionFailure,
    /// Requested by the embedder; excluded from the statistics
    Explicit,
}

impl GcCause {
    /// Whether the cause is an embedder request
    pub fn is_user_requested(self) -> bool {
        matches!(self, GcCause::Explicit)
    }
}

/// Recommendation for one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    /// Grow by the given words
    Grow(usize),
    /// Shrink by the given words
    Shrink(usize),
    /// Keep the current size
    NoChange,
}

/// Goal that drove a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingGoal {
    /// Policy has too few samples
    NotReady,
    /// Padded pause above the pause goal
    PauseTime,
    /// Mutator share of time below the throughput goal
    Throughput,
    /// Every goal met; reducing memory
    Footprint,
    /// Nothing to do
    None,
}

/// Result of one sizing round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingDecision {
    /// Change applied to the young recommendation
    pub young: SizeChange,
    /// Change applied to the old recommendation
    pub old: SizeChange,
    /// Goal that drove the round
    pub goal: SizingGoal,
    /// New young recommendation in words
    pub young_words: usize,
    /// New old recommendation in words
    pub old_words: usize,
}

// ---------------------------------------------------------------
// Policy
// ---------------------------------------------------------------

/// Adaptive size policy
pub struct AdaptiveSizePolicy {
    config: SizingConfig,
    clock: Arc<dyn Clock>,

    // timers: the instant the last pause of each kind ended / began
    minor_end: Duration,
    minor_begin: Option<Duration>,
    major_end: Duration,
    major_begin: Option<Duration>,
    latest_minor_interval: Duration,
    latest_major_interval: Duration,

    avg_minor_pause: AdaptivePaddedAverage,
    avg_major_pause: AdaptivePaddedAverage,
    avg_minor_interval: AdaptiveWeightedAverage,
    avg_major_interval: AdaptiveWeightedAverage,
    avg_minor_gc_cost: AdaptiveWeightedAverage,
    avg_major_gc_cost: AdaptiveWeightedAverage,
    avg_promoted: AdaptivePaddedAverage,
    avg_survived: AdaptivePaddedAverage,

    minor_pause_young_estimator: LinearLeastSquareFit,
    minor_cost_young_estimator: LinearLeastSquareFit,
    major_pause_old_estimator: LinearLeastSquareFit,
    major_pause_young_estimator: LinearLeastSquareFit,

    young_supplement: u32,
    young_size: usize,
    old_size: usize,
    recommended_young: usize,
    recommended_old: usize,
}

impl AdaptiveSizePolicy {
    /// Policy for generations currently `young_words` and `old_words` large
    pub fn new(config: SizingConfig, clock: Arc<dyn Clock>, young_words: usize, old_words: usize) -> Self {
        let weight = config.weight;
        let now = clock.now();
        Self {
            minor_end: now,
            minor_begin: None,
            major_end: now,
            major_begin: None,
            latest_minor_interval: Duration::ZERO,
            latest_major_interval: Duration::ZERO,
            avg_minor_pause: AdaptivePaddedAverage::new(weight, config.pause_padding),
            avg_major_pause: AdaptivePaddedAverage::new(weight, config.pause_padding),
            avg_minor_interval: AdaptiveWeightedAverage::new(weight),
            avg_major_interval: AdaptiveWeightedAverage::new(weight),
            avg_minor_gc_cost: AdaptiveWeightedAverage::new(weight),
            avg_major_gc_cost: AdaptiveWeightedAverage::new(weight),
            avg_promoted: AdaptivePaddedAverage::no_zero_deviation(weight, config.promoted_padding),
            avg_survived: AdaptivePaddedAverage::new(weight, config.survivor_padding),
            minor_pause_young_estimator: LinearLeastSquareFit::new(weight),
            minor_cost_young_estimator: LinearLeastSquareFit::new(weight),
            major_pause_old_estimator: LinearLeastSquareFit::new(weight),
            major_pause_young_estimator: LinearLeastSquareFit::new(weight),
            young_supplement: config.young_supplement,
            young_size: young_words,
            old_size: old_words,
            recommended_young: young_words.clamp(config.min_young_words, config.max_young_words),
            recommended_old: old_words.clamp(config.min_old_words, config.max_old_words),
            config,
            clock,
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    // ---------------------------------------------------------------
    // Sampling
    // ---------------------------------------------------------------

    /// A young collection is starting
    pub fn minor_collection_begin(&mut self) {
        let now = self.clock.now();
        self.latest_minor_interval = now.saturating_sub(self.minor_end);
        self.minor_begin = Some(now);
    }

    /// A young collection finished with the young generation at `young_words`
    pub fn minor_collection_end(&mut self, cause: GcCause, young_words: usize) {
        let now = self.clock.now();
        let begin = self.minor_begin.take().unwrap_or(now);
        self.minor_end = now;
        self.young_size = young_words;
        if cause.is_user_requested() {
            return;
        }

        let pause = now.saturating_sub(begin).as_secs_f64();
        let interval = self.latest_minor_interval.as_secs_f64();
        self.avg_minor_pause.sample(pause);
        self.minor_pause_young_estimator
            .update(young_words as f64, pause * 1000.0);

        if interval > 0.0 && pause > 0.0 {
            let cost = pause / (interval + pause);
            self.avg_minor_gc_cost.sample(cost);
            self.avg_minor_interval.sample(interval + pause);
            self.minor_cost_young_estimator.update(young_words as f64, cost);
        }

        let count = self.avg_minor_pause.count();
        if self.config.young_supplement_decay > 0
            && count <= self.config.initializing_steps
            && count.is_multiple_of(self.config.young_supplement_decay)
        {
            self.young_supplement >>= 1;
        }
    }

    /// A full collection is starting
    pub fn major_collection_begin(&mut self) {
        let now = self.clock.now();
        self.latest_major_interval = now.saturating_sub(self.major_end);
        self.major_begin = Some(now);
    }

    /// A full collection finished with the generations at the given sizes
    pub fn major_collection_end(&mut self, cause: GcCause, young_words: usize, old_words: usize) {
        let now = self.clock.now();
        let begin = self.major_begin.take().unwrap_or(now);
        self.major_end = now;
        self.young_size = young_words;
        self.old_size = old_words;
        if cause.is_user_requested() {
            return;
        }

        let pause = now.saturating_sub(begin).as_secs_f64();
        let interval = self.latest_major_interval.as_secs_f64();
        self.avg_major_pause.sample(pause);
        self.major_pause_old_estimator
            .update(old_words as f64, pause * 1000.0);
        self.major_pause_young_estimator
            .update(young_words as f64, pause * 1000.0);

        if interval > 0.0 && pause > 0.0 {
            self.avg_major_gc_cost.sample(pause / (interval + pause));
            self.avg_major_interval.sample(interval + pause);
        }
    }

    /// Record how much a young collection promoted and how much survived in young
    pub fn update_averages(&mut self, promoted_words: usize, survived_words: usize) {
        self.avg_promoted.sample(promoted_words as f64);
        self.avg_survived.sample(survived_words as f64);
    }

    // ---------------------------------------------------------------
    // Costs
    // ---------------------------------------------------------------

    /// Average fraction of time spent in young collections
    pub fn minor_gc_cost(&self) -> f64 {
        self.avg_minor_gc_cost.average().max(0.0)
    }

    /// Average fraction of time spent in full collections
    pub fn major_gc_cost(&self) -> f64 {
        self.avg_major_gc_cost.average().max(0.0)
    }

    /// Combined cost, at most 1
    pub fn gc_cost(&self) -> f64 {
        (self.minor_gc_cost() + self.major_gc_cost()).min(1.0)
    }

    /// Seconds since the last full collection ended
    pub fn time_since_major_gc(&self) -> f64 {
        self.clock.now().saturating_sub(self.major_end).as_secs_f64()
    }

    fn decaying_major_gc_cost(&self) -> f64 {
        let average = self.major_gc_cost();
        let since = self.time_since_major_gc();
        if since <= 0.0 {
            return average;
        }
        let decayed = average
            * (self.config.major_decay_time_scale as f64 * self.avg_major_interval.average())
            / since;
        average.min(decayed)
    }

    /// Minor cost plus a major cost that fades once full collections have
    /// been absent for `major_decay_time_scale` average intervals
    pub fn decaying_gc_cost(&self) -> f64 {
        let mut major = self.major_gc_cost();
        let avg_major_interval = self.avg_major_interval.average();
        if self.config.major_decay_time_scale > 0 && avg_major_interval > 0.0 {
            let threshold = self.config.major_decay_time_scale as f64 * avg_major_interval;
            if self.time_since_major_gc() > threshold {
                major = self.decaying_major_gc_cost();
            }
        }
        (major + self.minor_gc_cost()).min(1.0)
    }

    /// Fraction of time left to the mutator
    pub fn mutator_cost(&self) -> f64 {
        1.0 - self.decaying_gc_cost()
    }

    /// Whether enough young samples exist to act on
    pub fn young_gen_policy_is_ready(&self) -> bool {
        self.avg_minor_gc_cost.count() >= self.config.ready_threshold
    }

    /// Padded average pause of young collections, seconds
    pub fn padded_minor_pause(&self) -> f64 {
        self.avg_minor_pause.padded_average()
    }

    /// Padded average pause of full collections, seconds
    pub fn padded_major_pause(&self) -> f64 {
        self.avg_major_pause.padded_average()
    }

    /// Padded average of words promoted per young collection
    pub fn padded_average_promoted(&self) -> f64 {
        self.avg_promoted.padded_average()
    }

    /// Whether a young collection is expected to fit its promotions into `old_free` words
    pub fn promotion_attempt_is_safe(&self, old_free: usize) -> bool {
        self.avg_promoted.padded_average() <= old_free as f64
    }

    /// Predicted young pause (ms) at a young size
    pub fn predicted_minor_pause_ms(&self, young_words: usize) -> f64 {
        self.minor_pause_young_estimator.y(young_words as f64)
    }

    /// Predicted full pause (ms) at an old size
    pub fn predicted_major_pause_ms(&self, old_words: usize) -> f64 {
        self.major_pause_old_estimator.y(old_words as f64)
    }

    /// Predicted young-collection cost at a young size
    pub fn predicted_minor_cost(&self, young_words: usize) -> f64 {
        self.minor_cost_young_estimator.y(young_words as f64)
    }

    /// Predicted full pause (ms) at a young size
    pub fn predicted_major_pause_for_young_ms(&self, young_words: usize) -> f64 {
        self.major_pause_young_estimator.y(young_words as f64)
    }

    // ---------------------------------------------------------------
    // Increments
    // ---------------------------------------------------------------

    /// `size / 100 * percent`
    pub fn eden_increment_by(size: usize, percent: u32) -> usize {
        size / 100 * percent as usize
    }

    /// Young growth step at the configured increment
    pub fn eden_increment(&self, size: usize) -> usize {
        Self::eden_increment_by(size, self.config.young_increment)
    }

    /// Young growth step including the initialization supplement
    pub fn eden_increment_with_supplement(&self, size: usize) -> usize {
        Self::eden_increment_by(size, self.config.young_increment + self.young_supplement)
    }

    /// Young shrink step
    pub fn eden_decrement(&self, size: usize) -> usize {
        self.eden_increment(size) / self.config.decrement_scale_factor as usize
    }

    /// Old growth step
    pub fn promo_increment(&self, size: usize) -> usize {
        Self::eden_increment_by(size, self.config.old_increment)
    }

    /// Old shrink step
    pub fn promo_decrement(&self, size: usize) -> usize {
        self.promo_increment(size) / self.config.decrement_scale_factor as usize
    }

    /// Current young supplement percentage
    pub fn young_supplement(&self) -> u32 {
        self.young_supplement
    }

    // ---------------------------------------------------------------
    // Decisions
    // ---------------------------------------------------------------

    fn pause_goal_secs(&self) -> f64 {
        self.config
            .pause_goal
            .map_or(f64::INFINITY, |goal| goal.as_secs_f64())
    }

    /// Recompute both recommendations. `old_used` bounds the old
    /// recommendation from below together with the padded promotion average.
    pub fn compute_sizes(&mut self, old_used: usize) -> SizingDecision {
        let young = self.recommended_young;
        let old = self.recommended_old;

        let (goal, young_change, old_change) = if !self.young_gen_policy_is_ready() {
            (SizingGoal::NotReady, SizeChange::NoChange, SizeChange::NoChange)
        } else {
            let goal_secs = self.pause_goal_secs();
            let minor_pause = self.padded_minor_pause();
            let major_pause = self.padded_major_pause();
            if minor_pause > goal_secs || major_pause > goal_secs {
                // shrink whichever generation's pauses dominate
                if minor_pause >= major_pause {
                    (
                        SizingGoal::PauseTime,
                        SizeChange::Shrink(self.eden_decrement(young)),
                        SizeChange::NoChange,
                    )
                } else {
                    (
                        SizingGoal::PauseTime,
                        SizeChange::NoChange,
                        SizeChange::Shrink(self.promo_decrement(old)),
                    )
                }
            } else if self.mutator_cost() < self.config.throughput_goal() {
                let gc_cost = self.gc_cost();
                let (young_share, old_share) = if gc_cost > 0.0 {
                    (self.minor_gc_cost() / gc_cost, self.major_gc_cost() / gc_cost)
                } else {
                    (1.0, 0.0)
                };
                let young_delta =
                    (young_share * self.eden_increment_with_supplement(young) as f64) as usize;
                let old_delta = (old_share * self.promo_increment(old) as f64) as usize;
                (
                    SizingGoal::Throughput,
                    SizeChange::Grow(young_delta),
                    SizeChange::Grow(old_delta),
                )
            } else if self.config.footprint_goal {
                (
                    SizingGoal::Footprint,
                    SizeChange::Shrink(self.eden_decrement(young)),
                    SizeChange::Shrink(self.promo_decrement(old)),
                )
            } else {
                (SizingGoal::None, SizeChange::NoChange, SizeChange::NoChange)
            }
        };

        let old_floor = self
            .config
            .min_old_words
            .max(old_used + self.avg_promoted.padded_average().ceil() as usize)
            .min(self.config.max_old_words);
        let young_words = apply(young, young_change, self.config.min_young_words, self.config.max_young_words);
        let old_words = apply(old, old_change, old_floor, self.config.max_old_words);

        let decision = SizingDecision {
            young: effective(young, young_words),
            old: effective(old, old_words),
            goal,
            young_words,
            old_words,
        };
        self.recommended_young = young_words;
        self.recommended_old = old_words;

        tracing::debug!(
            target: "otter::gc",
            goal = ?decision.goal,
            young_words,
            old_words,
            minor_cost = self.minor_gc_cost(),
            major_cost = self.major_gc_cost(),
            mutator_cost = self.mutator_cost(),
            "Sizing decision"
        );
        decision
    }

    /// Young size to use for the next cycle, in words
    pub fn recommended_young_size(&self) -> usize {
        self.recommended_young
    }

    /// Old size to use for the next cycle, in words
    pub fn recommended_old_size(&self) -> usize {
        self.recommended_old
    }

    /// Young size observed at the last pause
    pub fn young_size(&self) -> usize {
        self.young_size
    }

    /// Old size observed at the last full pause
    pub fn old_size(&self) -> usize {
        self.old_size
    }
}

fn apply(current: usize, change: SizeChange, min: usize, max: usize) -> usize {
    let target = match change {
        SizeChange::Grow(delta) => current.saturating_add(delta),
        SizeChange::Shrink(delta) => current.saturating_sub(delta),
        SizeChange::NoChange => current,
    };
    target.clamp(min, max.max(min))
}

fn effective(before: usize, after: usize) -> SizeChange {
    match after.cmp(&before) {
        std::cmp::Ordering::Greater => SizeChange::Grow(after - before),
        std::cmp::Ordering::Less => SizeChange::Shrink(before - after),
        std::cmp::Ordering::Equal => SizeChange::NoChange,
    }
}
