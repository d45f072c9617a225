//! Recovery of structured JSON from free-form model output.
//!
//! [`parse`] is total: whatever the model returned, the caller gets a JSON
//! object back. How much of it is real data is recorded in
//! [`ParseOutcome::stage`].

mod partial;
mod repair;

pub use partial::{extract_best_effort, minimal_report, PREVIEW_CHARS};
pub use repair::{
    balance_brackets, close_unterminated_string, parse, parse_with_outcome,
    remove_trailing_commas, strip_fences, ParseOutcome, RepairStage,
};

use thiserror::Error;

/// Every structural stage failed. Internal to this module: callers of
/// [`parse`] get a partial or minimal object instead.
#[derive(Debug, Error)]
#[error("could not recover a JSON object: {reason}")]
pub(crate) struct ParseRecoveryExhausted {
    reason: String,
}

impl ParseRecoveryExhausted {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
