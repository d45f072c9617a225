//! Incremental delivery of an analysis as NDJSON events.
//!
//! Provider fragments are buffered by a [`SentenceSegmenter`] and emitted
//! as `sentence` events tagged with the report section being written. The
//! full text is then repaired and normalized exactly like a batch response
//! and sent as the final `complete` event.

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::analyzer::{step, Analyzer};
use crate::error::AnalysisError;
use crate::models::{AnalysisRequest, StreamEvent};
use crate::progress::ProgressTracker;
use crate::report::StructuredReport;
use crate::tokens::{has_sentence_boundary, sentence_ends, split_sentences};
use crate::tools::ProviderStream;

/// Buffer length at which the segmenter looks for boundaries even without
/// a terminal character.
pub const MIN_SEGMENT_CHARS: usize = 80;

const DEFAULT_SECTION: &str = "executive_summary";

const SECTION_KEYS: [&str; 14] = [
    "executive_summary",
    "analysis_overview",
    "key_findings",
    "key_insights",
    "detailed_analysis",
    "detailed_audience_analysis",
    "integrated_analysis",
    "strategic_recommendations",
    "strategic_implications",
    "forward_looking_recommendations",
    "execution_roadmap",
    "risk_response",
    "risk_governance",
    "appendix",
];

/// Splits a growing text buffer into complete sentences. The last, possibly
/// unfinished sentence stays buffered until more text or [`finish`].
///
/// [`finish`]: SentenceSegmenter::finish
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    min_chars: usize,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(MIN_SEGMENT_CHARS)
    }
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
        }
    }

    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        if self.buffer.chars().count() < self.min_chars && !has_sentence_boundary(&self.buffer) {
            return Vec::new();
        }
        let Some(&last) = sentence_ends(&self.buffer, false).last() else {
            return Vec::new();
        };
        let complete: String = self.buffer.drain(..last).collect();
        split_sentences(&complete)
    }

    /// Flush what is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Tracks which report section the model is currently writing: the known
/// key that appears latest in the text so far.
#[derive(Debug)]
pub struct SectionTracker {
    current: &'static str,
}

impl Default for SectionTracker {
    fn default() -> Self {
        Self {
            current: DEFAULT_SECTION,
        }
    }
}

impl SectionTracker {
    pub fn observe(&mut self, text: &str) -> &'static str {
        let latest = SECTION_KEYS
            .iter()
            .filter_map(|key| text.rfind(&format!("\"{key}\"")).map(|pos| (pos, *key)))
            .max_by_key(|(pos, _)| *pos);
        if let Some((_, key)) = latest {
            self.current = key;
        }
        self.current
    }
}

/// Sends events to the client and mirrors progress into the tracker.
struct Emitter<'a> {
    tx: &'a mpsc::Sender<StreamEvent>,
    progress: Option<&'a ProgressTracker>,
    last_percent: u8,
    open: bool,
}

impl<'a> Emitter<'a> {
    fn new(tx: &'a mpsc::Sender<StreamEvent>, progress: Option<&'a ProgressTracker>) -> Self {
        Self {
            tx,
            progress,
            last_percent: 0,
            open: true,
        }
    }

    /// False once the receiver is gone.
    async fn send(&mut self, event: StreamEvent) -> bool {
        if self.open && self.tx.send(event).await.is_err() {
            debug!("stream consumer went away");
            self.open = false;
        }
        self.open
    }

    async fn progress(&mut self, percent: i32, message: impl Into<String>) -> bool {
        let message = message.into();
        step(self.progress, percent, message.clone());
        self.last_percent = self.last_percent.max(percent.clamp(0, 100) as u8);
        let progress = self.last_percent;
        self.send(StreamEvent::Progress { progress, message }).await
    }

    async fn sentence(&mut self, content: String, section: &str) -> bool {
        self.send(StreamEvent::Sentence {
            content,
            section: section.to_string(),
        })
        .await
    }

    async fn complete(&mut self, report: StructuredReport) -> bool {
        self.progress(100, "Analysis complete").await;
        self.send(StreamEvent::Complete {
            data: Box::new(report),
        })
        .await
    }

    async fn error(&mut self, message: String) -> bool {
        self.send(StreamEvent::Error { message }).await
    }
}

enum Consumed {
    Text { text: String, model: String },
    Failed(AnalysisError),
    Disconnected,
}

async fn consume(opened: ProviderStream, emit: &mut Emitter<'_>) -> Consumed {
    let ProviderStream {
        mut fragments,
        provider,
        model_used,
        ..
    } = opened;
    let mut segmenter = SentenceSegmenter::default();
    let mut sections = SectionTracker::default();
    let mut text = String::new();
    let mut sentences = 0i32;

    while let Some(item) = fragments.next().await {
        let fragment = match item {
            Ok(fragment) => fragment,
            Err(err) if text.trim().is_empty() => {
                return Consumed::Failed(AnalysisError::provider_call(provider, err.to_string()));
            }
            Err(err) => {
                warn!(%provider, "stream interrupted, finishing with received text: {err}");
                break;
            }
        };
        text.push_str(&fragment);
        for sentence in segmenter.push(&fragment) {
            let section = sections.observe(&text);
            if !emit.sentence(sentence, section).await {
                return Consumed::Disconnected;
            }
            sentences += 1;
            if sentences % 5 == 0 {
                emit.progress((20 + sentences).min(90), "Receiving analysis").await;
            }
        }
    }

    if let Some(rest) = segmenter.finish() {
        let section = sections.observe(&text);
        if !emit.sentence(rest, section).await {
            return Consumed::Disconnected;
        }
    }
    if text.trim().is_empty() {
        return Consumed::Failed(AnalysisError::provider_call(
            provider,
            "provider returned an empty stream",
        ));
    }
    Consumed::Text {
        text,
        model: model_used,
    }
}

impl Analyzer {
    async fn emit_fallback(&self, request: &AnalysisRequest, errors: Vec<AnalysisError>, emit: &mut Emitter<'_>) {
        let report = self.fallback(request, errors);
        for sentence in split_sentences(report.executive_summary()) {
            if !emit.sentence(sentence, DEFAULT_SECTION).await {
                return;
            }
        }
        emit.complete(report).await;
    }

    /// Stream an analysis to `tx`. The last event is always `complete` or
    /// `error`, unless the receiver is dropped first.
    #[instrument(
        skip(self, request, progress, tx),
        fields(keyword = %request.target_keyword, target_type = %request.target_type)
    )]
    pub async fn stream_analysis(
        &self,
        request: &AnalysisRequest,
        progress: Option<&ProgressTracker>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let mut emit = Emitter::new(&tx, progress);
        if !emit.progress(5, "Preparing analysis").await {
            return;
        }

        let chain = self.chain();
        if chain.is_empty() {
            info!("no provider configured, streaming basic analysis");
            self.emit_fallback(request, Vec::new(), &mut emit).await;
            return;
        }

        let options = self.options(request);
        let mut errors = Vec::new();
        for (position, invoker) in chain.iter().enumerate() {
            let percent = if position == 0 { 10 } else { 40 };
            let label = invoker.provider().label();
            if !emit.progress(percent, format!("Streaming from {label}")).await {
                return;
            }

            let opened = match invoker.invoke_stream(&options).await {
                Ok(opened) => opened,
                Err(err) if err.is_configuration() && chain.len() == 1 => {
                    emit.error(err.to_string()).await;
                    return;
                }
                Err(err) => {
                    warn!(provider = %invoker.provider(), "could not open stream: {err}");
                    errors.push(err);
                    continue;
                }
            };

            match consume(opened, &mut emit).await {
                Consumed::Text { text, model } => {
                    emit.progress(92, "Structuring analysis").await;
                    let mut report = self.finalize(&text, invoker.provider(), &model, request);
                    report.metadata_mut().degradation =
                        Some(Self::degradation_for(invoker, position));
                    if self.wants_augmentation(request, invoker) {
                        emit.progress(95, "Augmenting with secondary provider").await;
                        report = self.augment(report, request, &options).await;
                    }
                    emit.complete(report).await;
                    return;
                }
                Consumed::Failed(err) => {
                    warn!(provider = %invoker.provider(), "stream failed: {err}");
                    errors.push(err);
                }
                Consumed::Disconnected => return,
            }
        }

        self.emit_fallback(request, errors, &mut emit).await;
    }
}
