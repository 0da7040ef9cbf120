//! Collector configuration
//!
//! Every tuning heuristic is a plain field with a documented default, so an
//! embedder can inject its own policy without touching collector code.

use std::time::Duration;

use crate::error::{GcError, GcResult};
use crate::heap::GenerationRole;

/// One generation in the heap layout
#[derive(Debug, Clone)]
pub struct GenerationSpec {
    /// Role of the generation
    pub role: GenerationRole,
    /// Capacity in words (multiple of the region size)
    pub capacity_words: usize,
    /// Generations that receive this one's live objects during compaction, in
    /// the order they are tried
    pub destinations: Vec<GenerationRole>,
}

/// Address-space layout of the heap
///
/// Generations are laid out in the order given, lowest address first. The same
/// order is the compaction walk order, so a destination must never come after
/// its source.
#[derive(Debug, Clone)]
pub struct HeapLayout {
    /// Region size in words (default: 1024)
    pub region_words: usize,
    /// Card size in words (default: 64)
    pub card_words: usize,
    /// Generations, lowest address first
    pub generations: Vec<GenerationSpec>,
}

impl Default for HeapLayout {
    fn default() -> Self {
        Self {
            region_words: 1024,
            card_words: 64,
            generations: vec![
                GenerationSpec {
                    role: GenerationRole::Permanent,
                    capacity_words: 16 * 1024,
                    destinations: vec![GenerationRole::Permanent],
                },
                GenerationSpec {
                    role: GenerationRole::Old,
                    capacity_words: 256 * 1024,
                    destinations: vec![GenerationRole::Old],
                },
                GenerationSpec {
                    role: GenerationRole::Young,
                    capacity_words: 64 * 1024,
                    destinations: vec![GenerationRole::Old, GenerationRole::Young],
                },
            ],
        }
    }
}

impl HeapLayout {
    /// Young + old layout with the given capacities and default geometry
    pub fn two_generation(young_words: usize, old_words: usize) -> Self {
        Self {
            generations: vec![
                GenerationSpec {
                    role: GenerationRole::Old,
                    capacity_words: old_words,
                    destinations: vec![GenerationRole::Old],
                },
                GenerationSpec {
                    role: GenerationRole::Young,
                    capacity_words: young_words,
                    destinations: vec![GenerationRole::Old, GenerationRole::Young],
                },
            ],
            ..Self::default()
        }
    }

    /// Builder-style override of region and card size
    pub fn with_geometry(mut self, region_words: usize, card_words: usize) -> Self {
        self.region_words = region_words;
        self.card_words = card_words;
        self
    }

    fn position(&self, role: GenerationRole) -> Option<usize> {
        self.generations.iter().position(|g| g.role == role)
    }

    fn validate(&self) -> GcResult<()> {
        if self.region_words == 0 || self.card_words == 0 {
            return Err(GcError::invalid_config("region and card sizes must be non-zero"));
        }
        if !self.region_words.is_multiple_of(self.card_words) {
            return Err(GcError::invalid_config(format!(
                "card size {} does not divide region size {}",
                self.card_words, self.region_words
            )));
        }
        for role in [GenerationRole::Young, GenerationRole::Old] {
            if self.position(role).is_none() {
                return Err(GcError::invalid_config(format!("missing {role:?} generation")));
            }
        }
        for (pos, spec) in self.generations.iter().enumerate() {
            if self.position(spec.role) != Some(pos) {
                return Err(GcError::invalid_config(format!(
                    "duplicate {:?} generation",
                    spec.role
                )));
            }
            if spec.capacity_words == 0 || !spec.capacity_words.is_multiple_of(self.region_words) {
                return Err(GcError::invalid_config(format!(
                    "{:?} capacity {} is not a non-zero multiple of the region size",
                    spec.role, spec.capacity_words
                )));
            }
            if spec.destinations.is_empty() {
                return Err(GcError::invalid_config(format!(
                    "{:?} has no compaction destinations",
                    spec.role
                )));
            }
            for dest in &spec.destinations {
                match self.position(*dest) {
                    None => {
                        return Err(GcError::invalid_config(format!(
                            "{:?} compacts into unknown generation {dest:?}",
                            spec.role
                        )));
                    }
                    Some(dest_pos) if dest_pos > pos => {
                        return Err(GcError::invalid_config(format!(
                            "{:?} compacts into {dest:?}, which lies above it",
                            spec.role
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Mark-compact policy knobs
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Percentage of the young generation allowed to stay as dead wood (default: 5)
    pub young_dead_ratio: u8,
    /// Percentage of the old generation allowed to stay as dead wood (default: 5)
    pub old_dead_ratio: u8,
    /// Percentage of the permanent generation allowed to stay as dead wood (default: 20)
    pub perm_dead_ratio: u8,
    /// Every Nth full collection ignores dead-wood slack (default: 4, 0 = never)
    pub always_compact_count: u32,
    /// Overwrite reclaimed memory with [`MANGLE_PATTERN`](crate::object::MANGLE_PATTERN)
    pub mangle_unused: bool,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            young_dead_ratio: 5,
            old_dead_ratio: 5,
            perm_dead_ratio: 20,
            always_compact_count: 4,
            mangle_unused: cfg!(debug_assertions),
        }
    }
}

impl CompactionPolicy {
    /// Dead-wood percentage for a generation role
    pub fn dead_ratio(&self, role: GenerationRole) -> u8 {
        match role {
            GenerationRole::Young => self.young_dead_ratio,
            GenerationRole::Old => self.old_dead_ratio,
            GenerationRole::Permanent => self.perm_dead_ratio,
        }
    }

    /// Whether dead-wood slack applies to the given full collection number (1-based)
    pub fn allows_dead_wood(&self, invocation: u64) -> bool {
        self.always_compact_count == 0 || !invocation.is_multiple_of(self.always_compact_count as u64)
    }
}

/// Displaced-header spool configuration
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Headers per spool block (default: 64)
    pub block_capacity: usize,
    /// Blocks charged to the scratch budget before falling back (default: 4)
    pub scratch_blocks: usize,
    /// Upper bound on blocks live at once (default: unbounded)
    pub max_blocks: Option<usize>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            block_capacity: 64,
            scratch_blocks: 4,
            max_blocks: None,
        }
    }
}

/// Remembered-set configuration
#[derive(Debug, Clone)]
pub struct RemSetConfig {
    /// Initial sparse table capacity, a power of two (default: 8)
    pub initial_capacity: usize,
}

impl Default for RemSetConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 8,
        }
    }
}

/// Adaptive sizing policy parameters
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Weight (0-100) given to new samples in moving averages (default: 10)
    pub weight: u32,
    /// Standard deviations of padding on pause averages (default: 1)
    pub pause_padding: u32,
    /// Standard deviations of padding on promoted-bytes average (default: 3)
    pub promoted_padding: u32,
    /// Standard deviations of padding on survivor average (default: 3)
    pub survivor_padding: u32,
    /// Young generation growth percentage (default: 20)
    pub young_increment: u32,
    /// Extra young growth percentage while initializing (default: 80)
    pub young_supplement: u32,
    /// Halve the young supplement every N minor samples (default: 8)
    pub young_supplement_decay: u32,
    /// Old generation growth percentage (default: 20)
    pub old_increment: u32,
    /// Shrink = grow / this factor (default: 4)
    pub decrement_scale_factor: u32,
    /// Decay major cost after this many average major intervals (default: 10, 0 = off)
    pub major_decay_time_scale: u32,
    /// Minor samples required before the policy acts (default: 5)
    pub ready_threshold: u32,
    /// Minor samples during which the young supplement applies (default: 20)
    pub initializing_steps: u32,
    /// Application time to GC time ratio (default: 99, i.e. 1% GC)
    pub gc_time_ratio: u32,
    /// Pause-time goal (default: none)
    pub pause_goal: Option<Duration>,
    /// Shrink generations when every other goal is met (default: true)
    pub footprint_goal: bool,
    /// Lower bound for young recommendations in words
    pub min_young_words: usize,
    /// Upper bound for young recommendations in words
    pub max_young_words: usize,
    /// Lower bound for old recommendations in words
    pub min_old_words: usize,
    /// Upper bound for old recommendations in words
    pub max_old_words: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            weight: 10,
            pause_padding: 1,
            promoted_padding: 3,
            survivor_padding: 3,
            young_increment: 20,
            young_supplement: 80,
            young_supplement_decay: 8,
            old_increment: 20,
            decrement_scale_factor: 4,
            major_decay_time_scale: 10,
            ready_threshold: 5,
            initializing_steps: 20,
            gc_time_ratio: 99,
            pause_goal: None,
            footprint_goal: true,
            min_young_words: 4 * 1024,
            max_young_words: 1024 * 1024,
            min_old_words: 16 * 1024,
            max_old_words: 4 * 1024 * 1024,
        }
    }
}

impl SizingConfig {
    /// Fraction of wall time the mutator should get (e.g. 0.99)
    pub fn throughput_goal(&self) -> f64 {
        1.0 - 1.0 / (1.0 + self.gc_time_ratio as f64)
    }

    fn validate(&self) -> GcResult<()> {
        for (name, value) in [
            ("weight", self.weight),
            ("young_increment", self.young_increment),
            ("old_increment", self.old_increment),
            ("young_supplement", self.young_supplement),
        ] {
            if value > 100 {
                return Err(GcError::invalid_config(format!("{name} = {value} exceeds 100")));
            }
        }
        if self.decrement_scale_factor == 0 {
            return Err(GcError::invalid_config("decrement_scale_factor must be non-zero"));
        }
        if self.min_young_words > self.max_young_words || self.min_old_words > self.max_old_words {
            return Err(GcError::invalid_config("sizing bounds are inverted"));
        }
        Ok(())
    }
}

/// Complete collector configuration
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// Heap layout
    pub layout: HeapLayout,
    /// Full-collection policy
    pub compaction: CompactionPolicy,
    /// Spool configuration
    pub spool: SpoolConfig,
    /// Remembered-set configuration
    pub remset: RemSetConfig,
    /// Sizing policy
    pub sizing: SizingConfig,
}

impl GcConfig {
    /// Check the configuration for inconsistencies
    pub fn validate(&self) -> GcResult<()> {
        self.layout.validate()?;
        for (name, ratio) in [
            ("young_dead_ratio", self.compaction.young_dead_ratio),
            ("old_dead_ratio", self.compaction.old_dead_ratio),
            ("perm_dead_ratio", self.compaction.perm_dead_ratio),
        ] {
            if ratio > 100 {
                return Err(GcError::invalid_config(format!("{name} = {ratio} exceeds 100")));
            }
        }
        if self.spool.block_capacity == 0 {
            return Err(GcError::invalid_config("spool block capacity must be non-zero"));
        }
        if !self.remset.initial_capacity.is_power_of_two() {
            return Err(GcError::invalid_config(format!(
                "remembered-set capacity {} is not a power of two",
                self.remset.initial_capacity
            )));
        }
        self.sizing.validate()
    }
}
