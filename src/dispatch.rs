//! Dispatch controller — the per-recipient state machine.
//!
//! Each recipient moves through
//! `Pending → Extracted → Generated → Composed → {Sent | Previewed | Failed}`.
//! A failing stage moves that recipient straight to `Failed`, records an
//! ERROR outcome and the batch moves on. Only outcome-log failures end a
//! run early with an error.
//!
//! Recipients are processed strictly one at a time, in dataset order. The
//! send cap counts SENT/PREVIEWED outcomes in that order; once reached,
//! remaining recipients are not touched at all.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::compose::MessageComposer;
use crate::error::{Error, GenerationError, SinkError, Stage, StageError};
use crate::extract::{ContextExtractor, ExtractStatus, ExtractedContext};
use crate::personalize::{GeneratedContent, PersonalizationGenerator};
use crate::recipients::Recipient;
use crate::recorder::{DispatchOutcome, OutcomeRecorder, OutcomeResult};
use crate::sink::{Delivery, Sink};

/// What to do when the generation call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationFallback {
    /// Record the recipient as ERROR; nothing is sent.
    #[default]
    Error,
    /// Compose from the heuristic template instead.
    Template,
}

/// Per-recipient states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    Pending,
    Extracted,
    Generated,
    Composed,
    Sent,
    Previewed,
    Failed,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every recipient was processed.
    Exhausted,
    /// The send cap was reached.
    CapReached,
    /// A stop was requested between recipients.
    Cancelled,
}

/// Counts for a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub attempted: usize,
    pub sent: usize,
    pub previewed: usize,
    pub failed: usize,
    pub stop_reason: StopReason,
}

impl RunSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            attempted: 0,
            sent: 0,
            previewed: 0,
            failed: 0,
            stop_reason: StopReason::Exhausted,
        }
    }

    /// SENT + PREVIEWED, the quantity bounded by the send cap.
    pub fn successes(&self) -> usize {
        self.sent + self.previewed
    }
}

/// Run-wide policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum SENT/PREVIEWED outcomes; `None` means unlimited.
    pub max_sends: Option<usize>,
    /// Delay before each paced send after the first.
    pub pacing: Duration,
    /// Behavior when generation fails.
    pub on_generation_failure: GenerationFallback,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_sends: Some(50),
            pacing: Duration::from_secs(20),
            on_generation_failure: GenerationFallback::Error,
        }
    }
}

/// Orchestrates the pipeline over a batch of recipients.
pub struct DispatchController {
    extractor: Arc<dyn ContextExtractor>,
    generator: PersonalizationGenerator,
    composer: MessageComposer,
    sink: Box<dyn Sink>,
    recorder: OutcomeRecorder,
    config: DispatchConfig,
    stop: Arc<AtomicBool>,
    /// SENT/PREVIEWED count, checked before each recipient.
    successes: usize,
    paced_sends: usize,
}

impl DispatchController {
    pub fn new(
        extractor: Arc<dyn ContextExtractor>,
        generator: PersonalizationGenerator,
        composer: MessageComposer,
        sink: Box<dyn Sink>,
        recorder: OutcomeRecorder,
        config: DispatchConfig,
    ) -> Self {
        Self {
            extractor,
            generator,
            composer,
            sink,
            recorder,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            successes: 0,
            paced_sends: 0,
        }
    }

    /// Handle that stops the run before the next recipient when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Process recipients in order until exhausted, capped or stopped.
    ///
    /// The sink is closed on every exit path, including a recorder failure.
    pub async fn run<I>(mut self, recipients: I) -> Result<RunSummary, Error>
    where
        I: IntoIterator<Item = Recipient>,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("dispatch_run", %run_id, sink = self.sink.name());

        async move {
            info!(
                max_sends = ?self.config.max_sends,
                fallback = ?self.config.on_generation_failure,
                "Starting dispatch run"
            );

            let result = self.run_inner(run_id, recipients).await;

            if let Err(e) = self.sink.close().await {
                warn!(error = %e, "Failed to close sink cleanly");
            }

            match &result {
                Ok(summary) => info!(
                    attempted = summary.attempted,
                    sent = summary.sent,
                    previewed = summary.previewed,
                    failed = summary.failed,
                    stop_reason = ?summary.stop_reason,
                    log = %self.recorder.path().display(),
                    "Dispatch run complete"
                ),
                Err(e) => error!(error = %e, "Dispatch run aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_inner<I>(&mut self, run_id: Uuid, recipients: I) -> Result<RunSummary, Error>
    where
        I: IntoIterator<Item = Recipient>,
    {
        let mut summary = RunSummary::new(run_id);

        for recipient in recipients {
            if self.cap_reached() {
                info!(successes = self.successes, "Send cap reached, stopping");
                summary.stop_reason = StopReason::CapReached;
                break;
            }
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop requested, ending run before next recipient");
                summary.stop_reason = StopReason::Cancelled;
                break;
            }

            let outcome = self.process(&recipient).await;
            self.recorder.append(&outcome)?;

            summary.attempted += 1;
            match outcome.result {
                OutcomeResult::Sent => summary.sent += 1,
                OutcomeResult::Previewed => summary.previewed += 1,
                OutcomeResult::Error => summary.failed += 1,
            }
            if outcome.result.is_success() {
                self.successes += 1;
            }
        }

        Ok(summary)
    }

    fn cap_reached(&self) -> bool {
        self.config
            .max_sends
            .is_some_and(|max| self.successes >= max)
    }

    /// Drive one recipient to a terminal state and build its outcome.
    async fn process(&mut self, recipient: &Recipient) -> DispatchOutcome {
        let mut progress = Progress::default();
        match self.advance(recipient, &mut progress).await {
            Ok(delivery) => {
                let (result, terminal) = match delivery {
                    Delivery::Sent => (OutcomeResult::Sent, RecipientState::Sent),
                    Delivery::Previewed => (OutcomeResult::Previewed, RecipientState::Previewed),
                };
                progress.move_to(recipient, terminal);
                DispatchOutcome::success(
                    &recipient.company_name,
                    &recipient.email,
                    progress.subject,
                    result,
                )
            }
            Err(e) => {
                warn!(
                    row = recipient.row_index,
                    company = %recipient.company_name,
                    stage = e.stage.label(),
                    error = %e.detail,
                    "Recipient failed"
                );
                progress.move_to(recipient, RecipientState::Failed);
                DispatchOutcome::error(
                    &recipient.company_name,
                    &recipient.email,
                    progress.subject,
                    e.to_string(),
                )
            }
        }
    }

    /// Run the stages up to and including the sink. Any stage error
    /// short-circuits the rest.
    async fn advance(
        &mut self,
        recipient: &Recipient,
        progress: &mut Progress,
    ) -> Result<Delivery, StageError> {
        let content = match recipient.first_line.as_deref() {
            Some(opener) => {
                debug!(row = recipient.row_index, "Using opener from sheet");
                self.generator.from_sheet(recipient, opener).ok_or_else(|| {
                    StageError::new(Stage::Generate, "sheet opener is empty after cleanup")
                })?
            }
            None => {
                let context = self.extractor.extract(recipient).await;
                if context.status != ExtractStatus::Ok {
                    debug!(
                        row = recipient.row_index,
                        status = ?context.status,
                        "Proceeding without site context"
                    );
                }
                progress.move_to(recipient, RecipientState::Extracted);

                match self.generator.generate(recipient, &context).await {
                    Ok(content) => content,
                    Err(e) => self.apply_fallback(recipient, &context, e)?,
                }
            }
        };
        progress.move_to(recipient, RecipientState::Generated);
        progress.subject = content.subject().to_string();

        let message = self.composer.compose(recipient, &content);
        progress.move_to(recipient, RecipientState::Composed);

        if self.sink.paced() {
            self.pace().await;
        }

        self.sink.accept(&message).await.map_err(|e| {
            let stage = match e {
                SinkError::Compose(_) => Stage::Compose,
                _ => Stage::Deliver,
            };
            StageError::new(stage, e.to_string())
        })
    }

    fn apply_fallback(
        &self,
        recipient: &Recipient,
        context: &ExtractedContext,
        err: GenerationError,
    ) -> Result<GeneratedContent, StageError> {
        match self.config.on_generation_failure {
            GenerationFallback::Error => Err(StageError::new(Stage::Generate, err.to_string())),
            GenerationFallback::Template => {
                warn!(
                    company = %recipient.company_name,
                    error = %err,
                    "Generation failed, composing from template"
                );
                Ok(self.generator.fallback(recipient, context))
            }
        }
    }

    /// Sleep before every paced send after the first, jittered ±25%.
    async fn pace(&mut self) {
        if self.paced_sends > 0 && !self.config.pacing.is_zero() {
            let base = self.config.pacing.as_secs_f64();
            let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
            let delay = Duration::from_secs_f64(base * (1.0 + jitter));
            debug!(delay_ms = delay.as_millis() as u64, "Pacing before send");
            tokio::time::sleep(delay).await;
        }
        self.paced_sends += 1;
    }
}

/// Where a recipient currently is, and the subject once known.
#[derive(Debug)]
struct Progress {
    state: RecipientState,
    subject: String,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: RecipientState::Pending,
            subject: String::new(),
        }
    }
}

impl Progress {
    fn move_to(&mut self, recipient: &Recipient, to: RecipientState) {
        debug!(row = recipient.row_index, from = ?self.state, ?to, "Recipient state transition");
        self.state = to;
    }
}
