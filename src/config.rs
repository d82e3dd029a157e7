//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::compose::{Attachment, MessageTemplate, SenderIdentity};
use crate::dispatch::{DispatchConfig, GenerationFallback};
use crate::error::ConfigError;
use crate::recipients::is_plausible_email;
use crate::sink::RunMode;

/// Everything a run needs apart from credentials, which are read from the
/// environment by the transport and LLM layers.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// CSV lead sheet.
    pub dataset: PathBuf,
    /// Preview or live.
    pub mode: RunMode,
    pub sender: SenderIdentity,
    /// Role or title being pitched.
    pub role: String,
    /// File attached to every message.
    pub attachment: Option<PathBuf>,
    /// Maximum SENT/PREVIEWED outcomes this run.
    pub max_sends: Option<usize>,
    /// Delay between live sends.
    pub pacing: Duration,
    /// Preview artifact directory.
    pub outbox: PathBuf,
    /// Outcome log path.
    pub log_path: PathBuf,
    pub on_generation_failure: GenerationFallback,
    pub template: MessageTemplate,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: PathBuf::from("leads.csv"),
            mode: RunMode::Preview,
            sender: SenderIdentity::new("", ""),
            role: "Software Engineer Intern".to_string(),
            attachment: None,
            max_sends: Some(50),
            pacing: Duration::from_secs(20),
            outbox: PathBuf::from("outbox_preview"),
            log_path: PathBuf::from("send_log.csv"),
            on_generation_failure: GenerationFallback::Error,
            template: MessageTemplate::default(),
        }
    }
}

impl RunConfig {
    /// Check the settings that do not depend on external services.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "from_name".into(),
                hint: "Pass --from-name.".into(),
            });
        }
        if !is_plausible_email(self.sender.email.trim()) {
            return Err(ConfigError::InvalidValue {
                key: "from_email".into(),
                message: format!("'{}' is not a valid address", self.sender.email),
            });
        }
        if self.role.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "role".into(),
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Load the attachment, failing if it was configured but is missing.
    pub fn load_attachment(&self) -> Result<Option<Attachment>, ConfigError> {
        self.attachment.as_ref().map(Attachment::load).transpose()
    }

    /// The controller policy derived from this config.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_sends: self.max_sends,
            pacing: self.pacing,
            on_generation_failure: self.on_generation_failure,
        }
    }
}
