//! Context window management: turns, estimation, budget, and structural edits.
//!
//! The context window is the scarcest resource in a long agent session. This
//! module keeps a conversation inside it without breaking its structure:
//!
//! 1. **[`turn`]** — [`Conversation`] is an arena of [`Turn`]s with stable
//!    IDs. Turns are appended, removed, or replaced, never reordered.
//!
//! 2. **[`estimator`]** — [`TokenEstimator`] scores turns plus the tool
//!    schema. Per-turn sums, so removal never raises the estimate.
//!
//! 3. **[`budget`]** — [`Budget`] (window, output reserve, trigger) and the
//!    one-shot [`MemoryWarning`] latch.
//!
//! 4. **[`editor`]** — [`StructuralEditor`] with FIFO trim, partial reset,
//!    summary replacement, and reasoning clearing. Every edit keeps the
//!    prompt and the tool-call/result pairing ([`invariants`]).
//!
//! 5. **[`cache`]** — [`CacheBreakpointSet`], ID-keyed prompt-cache
//!    breakpoints reconciled after every edit.
//!
//! 6. **[`summarizer`]** — the carry-over summary request.

pub mod budget;
pub mod cache;
pub mod editor;
pub mod estimator;
pub mod invariants;
pub mod summarizer;
pub mod turn;

// Re-export commonly used items at the module level.
pub use budget::{Budget, ContextUsage, MemoryWarning};
pub use cache::CacheBreakpointSet;
pub use editor::{EditKind, EditReport, StructuralEditor, TrimOutcome};
pub use estimator::{CharRatioEstimator, DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
pub use invariants::{PairingViolation, check_pairing};
pub use turn::{Conversation, Turn, TurnId};
