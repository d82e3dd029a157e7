//! Message composer — merges generated text with the fixed template, the
//! sender identity and the attachment into a transport-agnostic message.
//!
//! Composition is pure and total. Address validation and MIME assembly
//! happen later in [`ComposedMessage::to_mime`], which both sinks share so
//! preview artifacts match what a live send would transmit.

use std::path::Path;
use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::{Address, Message};

use crate::error::{ComposeError, ConfigError};
use crate::personalize::GeneratedContent;
use crate::recipients::Recipient;

// ── Sender identity ─────────────────────────────────────────────────

/// Who the mail is from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub name: String,
    pub email: String,
}

impl SenderIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// `Name <address>` display form.
    pub fn display(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

// ── Attachment ──────────────────────────────────────────────────────

/// A file attached to every message, loaded once before the batch starts.
#[derive(Debug, Clone)]
pub struct Attachment {
    filename: String,
    content_type: ContentType,
    bytes: Arc<[u8]>,
}

impl Attachment {
    /// Read the attachment from disk. A missing file is a configuration
    /// error raised before any recipient is processed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::MissingAttachment(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ConfigError::MissingAttachment(path.to_path_buf()))?;
        Self::from_bytes(filename, bytes)
    }

    /// Build an attachment from in-memory bytes, guessing the content type
    /// from the filename.
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Result<Self, ConfigError> {
        let filename = filename.into();
        let mime = guess_mime(&filename);
        let content_type =
            ContentType::parse(mime).map_err(|e| ConfigError::InvalidValue {
                key: "attachment".into(),
                message: format!("content type {mime}: {e}"),
            })?;
        Ok(Self {
            filename,
            content_type,
            bytes: bytes.into(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn guess_mime(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

// ── Template ────────────────────────────────────────────────────────

/// The fixed parts of every message.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    /// Lead-in placed before the opener, whose first letter is then
    /// lowercased (e.g. "I'm fascinated by how").
    pub opener_lead: Option<String>,
    /// Paragraph introducing the sender.
    pub pitch: String,
    /// Closing paragraph.
    pub closing: String,
    /// Extra signature lines below the sender name.
    pub signature_lines: Vec<String>,
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self {
            opener_lead: None,
            pitch: "I'm reaching out because I'd love to contribute to your team. My background \
                    spans software engineering and data analysis, and I enjoy turning messy \
                    problems into working tools."
                .to_string(),
            closing: "If there's any way I could take a bit off your plate, I'd be glad to help \
                      and to learn from your team. I'm open to a short chat and hope to hear \
                      back from you soon."
                .to_string(),
            signature_lines: Vec::new(),
        }
    }
}

// ── Composed message ────────────────────────────────────────────────

/// A fully formed outbound message, identical whether previewed or sent.
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub row_index: usize,
    pub company_name: String,
    pub to: String,
    pub sender: SenderIdentity,
    pub subject: String,
    pub body: String,
    pub attachment: Option<Arc<Attachment>>,
}

impl ComposedMessage {
    /// Build the MIME message a transport would send.
    pub fn to_mime(&self) -> Result<Message, ComposeError> {
        let from = Mailbox::new(Some(self.sender.name.clone()), parse_address(&self.sender.email)?);
        let to = Mailbox::new(None, parse_address(&self.to)?);

        let builder = Message::builder().from(from).to(to).subject(self.subject.clone());

        let text = SinglePart::builder()
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.clone());

        let message = match &self.attachment {
            Some(attachment) => builder.multipart(
                MultiPart::mixed().singlepart(text).singlepart(
                    MimeAttachment::new(attachment.filename.clone())
                        .body(attachment.bytes.to_vec(), attachment.content_type.clone()),
                ),
            ),
            None => builder.singlepart(text),
        };

        message.map_err(|e| ComposeError::Build(e.to_string()))
    }

    /// Human-readable preview of the message.
    pub fn render_preview(&self) -> String {
        let attachment = self
            .attachment
            .as_ref()
            .map(|a| a.filename().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "FROM: {}\nTO: {}\nSUBJECT: {}\nATTACHMENT: {}\n\n{}",
            self.sender.display(),
            self.to,
            self.subject,
            attachment,
            self.body
        )
    }
}

fn parse_address(address: &str) -> Result<Address, ComposeError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|e| ComposeError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

// ── Composer ────────────────────────────────────────────────────────

/// Composes messages from generated content and the fixed template.
#[derive(Debug, Clone)]
pub struct MessageComposer {
    sender: SenderIdentity,
    template: MessageTemplate,
    attachment: Option<Arc<Attachment>>,
}

impl MessageComposer {
    pub fn new(
        sender: SenderIdentity,
        template: MessageTemplate,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            sender,
            template,
            attachment: attachment.map(Arc::new),
        }
    }

    /// Merge content into the template. Never fails.
    pub fn compose(&self, recipient: &Recipient, content: &GeneratedContent) -> ComposedMessage {
        ComposedMessage {
            row_index: recipient.row_index,
            company_name: recipient.company_name.clone(),
            to: recipient.email.clone(),
            sender: self.sender.clone(),
            subject: content.subject().to_string(),
            body: self.render_body(recipient, content.opening_paragraph()),
            attachment: self.attachment.clone(),
        }
    }

    fn render_body(&self, recipient: &Recipient, opener: &str) -> String {
        let company = recipient.company_name.trim();
        let opener_block = match &self.template.opener_lead {
            Some(lead) => format!("{} {}", lead.trim_end(), lowercase_first(opener)),
            None => opener.to_string(),
        };

        let mut body = String::with_capacity(1024);
        body.push_str(&format!(
            "Hello {company} team. I hope this message finds you well,\n\n"
        ));
        body.push_str(&opener_block);
        body.push_str("\n\n");
        body.push_str(&self.template.pitch);
        body.push_str("\n\n");
        body.push_str(&self.template.closing);
        body.push_str("\n\nBest,\n");
        body.push_str(&self.sender.name);
        body.push('\n');
        for line in &self.template.signature_lines {
            body.push_str(line);
            body.push('\n');
        }
        body.push_str(&format!("Email: {}\n", self.sender.email));
        if let Some(attachment) = &self.attachment {
            body.push_str(&format!("Attached: {}\n", attachment.filename));
        }
        let website = recipient.website.trim();
        body.push_str(&format!(
            "Website noted: {}\n",
            if website.is_empty() { "-" } else { website }
        ));
        body
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mail_parser::{MessageParser, MimeHeaders};

    use super::*;
    use crate::personalize::ContentSource;

    fn recipient() -> Recipient {
        Recipient {
            company_name: "Acme Capital".into(),
            website: "acme.com".into(),
            email: "ops@acme.com".into(),
            row_index: 1,
            first_line: None,
        }
    }

    fn content() -> GeneratedContent {
        GeneratedContent::new(
            1,
            "Helping Acme Capital with credit analytics",
            "Acme backs climate founders across Europe.",
            ContentSource::Llm,
        )
        .unwrap()
    }

    fn composer(attachment: Option<Attachment>) -> MessageComposer {
        MessageComposer::new(
            SenderIdentity::new("Jordan Lee", "jordan@example.com"),
            MessageTemplate {
                signature_lines: vec!["GitHub: https://github.com/jlee".into()],
                ..Default::default()
            },
            attachment,
        )
    }

    #[test]
    fn body_contains_all_parts_in_order() {
        let msg = composer(None).compose(&recipient(), &content());
        let greeting = msg.body.find("Hello Acme Capital team").unwrap();
        let opener = msg.body.find("Acme backs climate founders").unwrap();
        let pitch = msg.body.find("I'm reaching out").unwrap();
        let signature = msg.body.find("Best,\nJordan Lee\nGitHub:").unwrap();
        assert!(greeting < opener && opener < pitch && pitch < signature);
        assert!(msg.body.contains("Email: jordan@example.com"));
        assert!(msg.body.contains("Website noted: acme.com"));
        assert!(!msg.body.contains("Attached:"));
        assert_eq!(msg.subject, "Helping Acme Capital with credit analytics");
        assert_eq!(msg.to, "ops@acme.com");
    }

    #[test]
    fn opener_lead_lowercases_first_letter() {
        let composer = MessageComposer::new(
            SenderIdentity::new("Jordan Lee", "jordan@example.com"),
            MessageTemplate {
                opener_lead: Some("I'm fascinated by how".into()),
                ..Default::default()
            },
            None,
        );
        let msg = composer.compose(&recipient(), &content());
        assert!(msg.body.contains("I'm fascinated by how acme backs climate founders"));
    }

    #[test]
    fn missing_website_is_dash() {
        let mut r = recipient();
        r.website.clear();
        let msg = composer(None).compose(&r, &content());
        assert!(msg.body.contains("Website noted: -"));
    }

    #[test]
    fn attachment_load_missing_is_config_error() {
        let err = Attachment::load("/no/such/resume.pdf").unwrap_err();
        assert!(matches!(err, ConfigError::MissingAttachment(_)));
    }

    #[test]
    fn attachment_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.pdf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"%PDF-1.4 test")
            .unwrap();
        let attachment = Attachment::load(&path).unwrap();
        assert_eq!(attachment.filename(), "resume.pdf");
        assert_eq!(attachment.len(), 13);
        assert_eq!(guess_mime("CV.DOCX"), "application/vnd.openxmlformats-officedocument.wordprocessingml.document");
        assert_eq!(guess_mime("blob"), "application/octet-stream");
    }

    #[test]
    fn mime_round_trip_preserves_identity_company_and_attachment() {
        let attachment = Attachment::from_bytes("resume.pdf", b"%PDF-1.4 test".to_vec()).unwrap();
        let msg = composer(Some(attachment)).compose(&recipient(), &content());
        let raw = msg.to_mime().unwrap().formatted();

        let parsed = MessageParser::default().parse(&raw[..]).unwrap();
        assert_eq!(parsed.subject(), Some("Helping Acme Capital with credit analytics"));

        let from = parsed.from().and_then(|a| a.first()).unwrap();
        assert_eq!(from.name(), Some("Jordan Lee"));
        assert_eq!(from.address(), Some("jordan@example.com"));

        let text = parsed.body_text(0).unwrap();
        assert!(text.contains("Jordan Lee"));
        assert!(text.contains("jordan@example.com"));
        assert!(text.contains("Acme Capital"));
        assert!(text.contains("Attached: resume.pdf"));

        let part = parsed.attachments().next().unwrap();
        assert_eq!(MimeHeaders::attachment_name(part), Some("resume.pdf"));
        assert_eq!(part.contents(), b"%PDF-1.4 test");
    }

    #[test]
    fn invalid_recipient_address_fails_mime() {
        let mut r = recipient();
        r.email = "not an address".into();
        let msg = composer(None).compose(&r, &content());
        assert!(matches!(msg.to_mime(), Err(ComposeError::InvalidAddress { .. })));
    }

    #[test]
    fn preview_lists_headers() {
        let attachment = Attachment::from_bytes("resume.pdf", vec![1, 2, 3]).unwrap();
        let preview = composer(Some(attachment))
            .compose(&recipient(), &content())
            .render_preview();
        assert!(preview.starts_with("FROM: Jordan Lee <jordan@example.com>\nTO: ops@acme.com\n"));
        assert!(preview.contains("SUBJECT: Helping Acme Capital with credit analytics"));
        assert!(preview.contains("ATTACHMENT: resume.pdf"));
    }
}
