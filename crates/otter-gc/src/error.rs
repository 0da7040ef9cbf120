//! Error types for otter-gc
//!
//! Recoverable conditions (remembered-set overflow, a sizing policy that has
//! not seen enough samples) never surface here; they are handled where they
//! occur. Everything in [`GcError`] aborts the current collection attempt.

use thiserror::Error;

use crate::heap::GenerationRole;

/// Errors that can occur during allocation or collection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// A live young object could not be promoted into the old generation.
    ///
    /// The heap is left consistent; callers retry with a full collection.
    #[error("promotion failed: {failed_objects} object(s) ({failed_words} words) stayed in the young generation")]
    PromotionFailed {
        /// Number of objects that could not be promoted
        failed_objects: usize,
        /// Words occupied by those objects
        failed_words: usize,
    },

    /// No spool block was available to preserve a displaced header
    #[error("spool exhausted: {blocks_in_use} block(s) in use, limit {limit}")]
    SpoolExhausted {
        /// Blocks currently handed out
        blocks_in_use: usize,
        /// Configured upper bound on live blocks
        limit: usize,
    },

    /// Compaction ran out of destination generations
    #[error("compaction destinations exhausted while placing {size_words} words from the {generation:?} generation")]
    CompactionExhausted {
        /// Generation whose object could not be placed
        generation: GenerationRole,
        /// Size of the object that did not fit
        size_words: usize,
    },

    /// An allocation could not be satisfied even after a full collection
    #[error("out of memory: cannot allocate {size_words} words")]
    OutOfMemory {
        /// Requested size
        size_words: usize,
    },

    /// Configuration rejected by validation
    #[error("invalid GC configuration: {0}")]
    InvalidConfig(String),

    /// Heap verification found an inconsistency
    #[error("heap corrupted: {0}")]
    HeapCorrupted(String),

    /// The collector hit an unrecoverable error earlier and refuses further work
    #[error("collector is poisoned after an unrecoverable error")]
    Poisoned,
}

impl GcError {
    /// Create a configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the heap is still usable after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PromotionFailed { .. }
                | Self::SpoolExhausted { .. }
                | Self::OutOfMemory { .. }
                | Self::InvalidConfig(_)
        )
    }
}

/// Result type alias for collector operations
pub type GcResult<T> = Result<T, GcError>;

/// Checks a collector invariant in every build profile.
///
/// On failure the diagnostic is logged on the `otter::gc` target before the
/// panic, so the dump survives `panic = "abort"`.
macro_rules! guarantee {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let message = format!($($arg)+);
            tracing::error!(target: "otter::gc", invariant = stringify!($cond), "{}", message);
            panic!("GC invariant violated: {}", message);
        }
    };
}

pub(crate) use guarantee;
