pub mod analyzer;
pub mod fallback;
pub mod insights;
pub mod merge;
pub mod prompt;
pub mod streaming;

pub use analyzer::Analyzer;
pub use fallback::{basic_fallback, FallbackReason};
pub use insights::InsightKind;
pub use merge::{merge_reports, MergeMismatch};
pub use streaming::{SectionTracker, SentenceSegmenter};
