//! Output sinks. Exactly one is active for a whole run: the preview sink
//! writes artifacts locally, the live sink hands messages to a mail
//! transport. The dispatch controller is written once against [`Sink`].

pub mod preview;
pub mod smtp;

pub use preview::PreviewSink;
pub use smtp::{SmtpConfig, SmtpMailer};

use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use lettre::Message;
use tracing::info;

use crate::compose::ComposedMessage;
use crate::error::{ConfigError, SinkError};

/// Run mode selected for the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Preview,
    Live,
}

/// Terminal success produced by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Previewed,
}

/// Destination for composed messages.
#[async_trait]
pub trait Sink: Send {
    /// Sink name, for logging.
    fn name(&self) -> &'static str;

    /// Whether sends through this sink should be paced.
    fn paced(&self) -> bool;

    /// Accept one message.
    async fn accept(&mut self, message: &ComposedMessage) -> Result<Delivery, SinkError>;

    /// Release any session held by the sink. Called once on every exit path.
    async fn close(&mut self) -> Result<(), SinkError>;
}

/// A mail transport session.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

// ── Live sink ───────────────────────────────────────────────────────

/// Sends every message through a transport session owned for the run.
pub struct LiveSink {
    transport: Box<dyn MailTransport>,
    sent: usize,
}

impl LiveSink {
    pub fn new(transport: Box<dyn MailTransport>) -> Self {
        Self { transport, sent: 0 }
    }
}

#[async_trait]
impl Sink for LiveSink {
    fn name(&self) -> &'static str {
        "live"
    }

    fn paced(&self) -> bool {
        true
    }

    async fn accept(&mut self, message: &ComposedMessage) -> Result<Delivery, SinkError> {
        let mime = message.to_mime()?;
        self.transport.send(mime).await?;
        self.sent += 1;
        info!(to = %message.to, company = %message.company_name, "Email sent");
        Ok(Delivery::Sent)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        info!(sent = self.sent, "Closing mail transport");
        self.transport.close().await
    }
}

/// Build the sink for `mode`. The transport is only connected in live
/// mode; preview never calls `connect`.
pub async fn select_sink<F, Fut>(
    mode: RunMode,
    outbox: &Path,
    connect: F,
) -> Result<Box<dyn Sink>, ConfigError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Box<dyn MailTransport>, ConfigError>>,
{
    match mode {
        RunMode::Preview => Ok(Box::new(PreviewSink::new(outbox)?)),
        RunMode::Live => Ok(Box::new(LiveSink::new(connect().await?))),
    }
}
