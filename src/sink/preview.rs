//! Preview sink — writes each composed message to the outbox instead of
//! sending it.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use super::{Delivery, Sink};
use crate::compose::ComposedMessage;
use crate::error::{ConfigError, SinkError};

static UNSAFE_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").unwrap());
static UNSAFE_ADDRESS_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.@+-]+").unwrap());

/// Max characters of the company name used in artifact filenames.
const MAX_NAME_CHARS: usize = 60;

/// Writes `<company>__<email>.txt` (readable) and `.eml` (the exact MIME a
/// live send would transmit) per recipient.
pub struct PreviewSink {
    outbox: PathBuf,
    written: usize,
}

impl PreviewSink {
    /// Create the sink, creating the outbox directory if needed.
    pub fn new(outbox: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let outbox = outbox.as_ref().to_path_buf();
        std::fs::create_dir_all(&outbox).map_err(|source| ConfigError::Io {
            path: outbox.clone(),
            source,
        })?;
        Ok(Self { outbox, written: 0 })
    }

    /// Artifact path for a message with the given extension.
    pub fn artifact_path(&self, message: &ComposedMessage, extension: &str) -> PathBuf {
        self.outbox.join(format!(
            "{}__{}.{extension}",
            safe_file_component(&message.company_name),
            safe_address_component(&message.to)
        ))
    }
}

#[async_trait]
impl Sink for PreviewSink {
    fn name(&self) -> &'static str {
        "preview"
    }

    fn paced(&self) -> bool {
        false
    }

    async fn accept(&mut self, message: &ComposedMessage) -> Result<Delivery, SinkError> {
        let mime = message.to_mime()?;

        let txt = self.artifact_path(message, "txt");
        tokio::fs::write(&txt, message.render_preview())
            .await
            .map_err(|source| SinkError::PreviewWrite {
                path: txt.clone(),
                source,
            })?;

        let eml = self.artifact_path(message, "eml");
        tokio::fs::write(&eml, mime.formatted())
            .await
            .map_err(|source| SinkError::PreviewWrite {
                path: eml.clone(),
                source,
            })?;

        self.written += 1;
        info!(path = %txt.display(), company = %message.company_name, "Preview written");
        Ok(Delivery::Previewed)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        info!(written = self.written, outbox = %self.outbox.display(), "Preview run finished");
        Ok(())
    }
}

/// Replace anything outside `[A-Za-z0-9_.-]` with `_` and cap the length.
pub fn safe_file_component(name: &str) -> String {
    UNSAFE_CHARS_RE
        .replace_all(name.trim(), "_")
        .chars()
        .take(MAX_NAME_CHARS)
        .collect()
}

/// Like [`safe_file_component`] but keeps `@` and `+`, uncapped.
pub fn safe_address_component(address: &str) -> String {
    UNSAFE_ADDRESS_CHARS_RE
        .replace_all(address.trim(), "_")
        .into_owned()
}
