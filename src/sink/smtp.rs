//! SMTP transport via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use super::MailTransport;
use crate::error::{ConfigError, SinkError};

/// Hosts that only accept STARTTLS.
const STARTTLS_HOSTS: &[&str] = &["smtp.office365.com", "smtp-mail.outlook.com"];

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Build config from `SMTP_HOST`, `SMTP_PORT`, `SMTP_USER` and
    /// `SMTP_PASS`. The user defaults to the sender address; the password
    /// is required.
    pub fn from_env(default_user: &str) -> Result<Self, ConfigError> {
        let host = std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_string());

        let port = match std::env::var("SMTP_PORT") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "SMTP_PORT".into(),
                message: format!("'{raw}' is not a port number"),
            })?,
            Err(_) => 465,
        };

        let username = std::env::var("SMTP_USER").unwrap_or_else(|_| default_user.to_string());

        let password = std::env::var("SMTP_PASS")
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "SMTP_PASS".into(),
                hint: "Set SMTP_PASS (for Gmail, create an App Password) or use --dry-run.".into(),
            })?;

        Ok(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            timeout: Duration::from_secs(30),
        })
    }

    /// STARTTLS on 587 and on hosts that require it; implicit TLS otherwise.
    pub fn uses_starttls(&self) -> bool {
        self.port == 587 || STARTTLS_HOSTS.contains(&self.host.to_lowercase().as_str())
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// A pooled SMTP session held for the duration of a run.
pub struct SmtpMailer {
    transport: Option<SmtpTransport>,
}

impl SmtpMailer {
    /// Build the transport and verify the server is reachable.
    pub async fn connect(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let relay = if config.uses_starttls() {
            SmtpTransport::starttls_relay(&config.host)
        } else {
            SmtpTransport::relay(&config.host)
        };
        let builder =
            relay.map_err(|e| ConfigError::Transport(format!("SMTP relay error: {e}")))?;

        let transport = builder
            .port(config.port)
            .timeout(Some(config.timeout))
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ))
            .build();

        let probe = transport.clone();
        let reachable = tokio::task::spawn_blocking(move || probe.test_connection())
            .await
            .map_err(|e| ConfigError::Transport(format!("connection check aborted: {e}")))?
            .map_err(|e| ConfigError::Transport(format!("cannot reach {}: {e}", config.host)))?;
        if !reachable {
            return Err(ConfigError::Transport(format!(
                "SMTP server {}:{} did not accept a connection",
                config.host, config.port
            )));
        }

        info!(
            host = %config.host,
            port = config.port,
            starttls = config.uses_starttls(),
            "SMTP transport ready"
        );
        Ok(Self {
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, message: Message) -> Result<(), SinkError> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| SinkError::SendFailed("transport already closed".into()))?;

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| SinkError::Join(e.to_string()))?
            .map_err(|e| SinkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(transport) = self.transport.take() {
            // Dropping the last handle shuts the pooled connections down.
            tokio::task::spawn_blocking(move || drop(transport))
                .await
                .map_err(|e| SinkError::Join(e.to_string()))?;
            debug!("SMTP transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str, port: u16) -> SmtpConfig {
        SmtpConfig {
            host: host.into(),
            port,
            username: "user".into(),
            password: SecretString::from("pass"),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn tls_mode_selection() {
        assert!(config("smtp.gmail.com", 587).uses_starttls());
        assert!(!config("smtp.gmail.com", 465).uses_starttls());
        assert!(config("SMTP.office365.com", 25).uses_starttls());
    }

    #[test]
    fn from_env_requires_password() {
        // SAFETY: no other test in this module reads SMTP_PASS concurrently.
        unsafe { std::env::remove_var("SMTP_PASS") };
        let err = SmtpConfig::from_env("me@example.com").unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "SMTP_PASS"));
    }

    #[tokio::test]
    async fn closed_mailer_rejects_sends() {
        let mut mailer = SmtpMailer { transport: None };
        mailer.close().await.unwrap();
        let message = Message::builder()
            .from("a@example.com".parse().unwrap())
            .to("b@example.com".parse().unwrap())
            .subject("x")
            .body(String::from("y"))
            .unwrap();
        assert!(matches!(mailer.send(message).await, Err(SinkError::SendFailed(_))));
    }
}
