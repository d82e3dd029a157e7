use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use bulk_outreach::compose::{MessageComposer, MessageTemplate, SenderIdentity};
use bulk_outreach::config::RunConfig;
use bulk_outreach::dispatch::{DispatchController, GenerationFallback, StopReason};
use bulk_outreach::extract::{ContextExtractor, ExtractorConfig, WebExtractor};
use bulk_outreach::llm::{LlmConfig, create_provider};
use bulk_outreach::personalize::{GeneratorConfig, PersonalizationGenerator};
use bulk_outreach::recipients::RecipientSource;
use bulk_outreach::recorder::OutcomeRecorder;
use bulk_outreach::sink::{MailTransport, RunMode, SmtpConfig, SmtpMailer, select_sink};

/// Personalized bulk outreach: scrape, generate, compose, preview or send.
#[derive(Debug, Parser)]
#[command(name = "bulk-outreach", version, about)]
struct Cli {
    /// CSV file of leads (Company, Website, Email columns).
    #[arg(long)]
    dataset: PathBuf,

    /// Your name, used in From and the signature.
    #[arg(long)]
    from_name: String,

    /// Address to send from.
    #[arg(long)]
    from_email: String,

    /// Role you are pitching for.
    #[arg(long, default_value = "Software Engineer Intern")]
    role: String,

    /// File to attach to every message (e.g. a resume PDF).
    #[arg(long)]
    attachment: Option<PathBuf>,

    /// Maximum emails sent or previewed this run (0 processes nothing).
    #[arg(long = "max", env = "MAX_PER_RUN", default_value_t = 50)]
    max_sends: usize,

    /// Ignore --max and process every row.
    #[arg(long)]
    unlimited: bool,

    /// Seconds to wait between live sends.
    #[arg(long, default_value_t = 20.0)]
    rate_secs: f64,

    /// Do everything except actually send.
    #[arg(long)]
    dry_run: bool,

    /// Folder for preview artifacts in dry-run mode.
    #[arg(long, default_value = "outbox_preview")]
    outbox: PathBuf,

    /// Outcome log (appended, created with a header if missing).
    #[arg(long, default_value = "send_log.csv")]
    log: PathBuf,

    /// What to do when personalization fails for a recipient.
    #[arg(long, value_enum, default_value_t = FallbackArg::Error)]
    on_generation_failure: FallbackArg,

    /// Lead-in placed before the generated opener.
    #[arg(long)]
    opener_lead: Option<String>,

    /// Paragraph introducing yourself (replaces the default).
    #[arg(long)]
    pitch: Option<String>,

    /// Closing paragraph (replaces the default).
    #[arg(long)]
    closing: Option<String>,

    /// Extra signature line; repeatable.
    #[arg(long = "signature-line")]
    signature_lines: Vec<String>,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FallbackArg {
    /// Record the recipient as ERROR.
    Error,
    /// Compose from a heuristic template.
    Template,
}

impl From<FallbackArg> for GenerationFallback {
    fn from(arg: FallbackArg) -> Self {
        match arg {
            FallbackArg::Error => Self::Error,
            FallbackArg::Template => Self::Template,
        }
    }
}

impl Cli {
    fn into_run_config(self) -> anyhow::Result<RunConfig> {
        if !self.rate_secs.is_finite() || self.rate_secs < 0.0 {
            anyhow::bail!("--rate-secs must be a non-negative number");
        }

        let mut template = MessageTemplate {
            opener_lead: self.opener_lead,
            signature_lines: self.signature_lines,
            ..Default::default()
        };
        if let Some(pitch) = self.pitch {
            template.pitch = pitch;
        }
        if let Some(closing) = self.closing {
            template.closing = closing;
        }

        Ok(RunConfig {
            dataset: self.dataset,
            mode: if self.dry_run {
                RunMode::Preview
            } else {
                RunMode::Live
            },
            sender: SenderIdentity::new(self.from_name.trim(), self.from_email.trim()),
            role: self.role,
            attachment: self.attachment,
            max_sends: (!self.unlimited).then_some(self.max_sends),
            pacing: Duration::from_secs_f64(self.rate_secs),
            outbox: self.outbox,
            log_path: self.log,
            on_generation_failure: self.on_generation_failure.into(),
            template,
        })
    }
}

/// Install the stderr subscriber, plus a daily rolling file when
/// `OUTREACH_LOG_DIR` is set. The returned guard flushes the file writer.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match std::env::var("OUTREACH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bulk-outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

/// Mark a stop request. Returns true if one was already pending.
fn record_interrupt(stop: &AtomicBool) -> bool {
    stop.swap(true, Ordering::SeqCst)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let _log_guard = init_tracing();

    let cli = Cli::parse();
    let json_summary = cli.json;
    let config = cli.into_run_config()?;
    config.validate()?;

    eprintln!("📬 Bulk Outreach v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Dataset: {}", config.dataset.display());
    eprintln!(
        "   Mode: {}",
        match config.mode {
            RunMode::Preview => "preview (dry run)",
            RunMode::Live => "live",
        }
    );
    eprintln!(
        "   Cap: {}",
        config
            .max_sends
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );

    // ── Configuration-level checks, before any recipient ────────────────
    let source = RecipientSource::open(&config.dataset)?;
    let attachment = config.load_attachment()?;
    if let Some(ref a) = attachment {
        eprintln!("   Attachment: {} ({} bytes)", a.filename(), a.len());
    }

    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config)?;

    let extractor: Arc<dyn ContextExtractor> = Arc::new(
        WebExtractor::new(ExtractorConfig::default()).context("failed to build HTTP client")?,
    );
    let generator = PersonalizationGenerator::new(
        llm,
        GeneratorConfig {
            role: config.role.clone(),
            ..Default::default()
        },
    );
    let composer = MessageComposer::new(config.sender.clone(), config.template.clone(), attachment);

    let from_email = config.sender.email.clone();
    let sink = select_sink(config.mode, &config.outbox, || async move {
        let smtp = SmtpConfig::from_env(&from_email)?;
        let mailer = SmtpMailer::connect(&smtp).await?;
        Ok(Box::new(mailer) as Box<dyn MailTransport>)
    })
    .await?;

    let controller = DispatchController::new(
        extractor,
        generator,
        composer,
        sink,
        OutcomeRecorder::new(&config.log_path),
        config.dispatch_config(),
    );

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if record_interrupt(&stop) {
                tracing::error!("Second interrupt, exiting immediately");
                std::process::exit(130);
            }
            tracing::warn!(
                "Interrupt received, stopping after the current recipient (Ctrl-C again to exit now)"
            );
        }
    });

    let recipients = source.iter()?;
    let summary = controller.run(recipients).await?;

    if json_summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    eprintln!(
        "\nProcessed {} recipients: {} sent, {} previewed, {} errors{}",
        summary.attempted,
        summary.sent,
        summary.previewed,
        summary.failed,
        match summary.stop_reason {
            StopReason::Exhausted => "",
            StopReason::CapReached => " (send cap reached)",
            StopReason::Cancelled => " (interrupted)",
        }
    );
    eprintln!("Log -> {}", config.log_path.display());
    if config.mode == RunMode::Preview {
        eprintln!("Preview emails saved in: {}", config.outbox.display());
        eprintln!("When ready, remove --dry-run to actually send.");
    }

    Ok(())
}
