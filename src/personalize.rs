//! Personalization generator — one LLM call per recipient producing a
//! subject line and an opening paragraph.
//!
//! The response shape is enforced here: either exactly one subject and one
//! paragraph, both non-empty, or an error. No placeholder text is ever
//! substituted for a failed call; the template fallback is a separate,
//! explicitly selected path.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{GenerationError, LlmError};
use crate::extract::{ExtractStatus, ExtractedContext};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::recipients::Recipient;

/// Phrase used when no text is available to mine.
const DEFAULT_HELPER_PHRASE: &str = "analytics support";

/// Fallback phrases appended to the heuristic candidates.
const KEYWORD_PHRASES: &[&str] = &[
    "sustainable finance",
    "inclusive finance",
    "credit analytics",
    "portfolio risk",
    "quant research",
    "deal sourcing",
    "market intelligence",
    "growth analytics",
    "data engineering",
    "automation",
    "fund operations",
    "fintech infrastructure",
];

static PREPOSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:in|on|around|for|within)\s+([A-Za-z][A-Za-z\- ]{3,50})").unwrap()
});
static CAPITALIZED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+){0,3})\b").unwrap());
static NON_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z\- ]+").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*\**\s*(subject|opener)\s*\**\s*:\s*\**\s*(.*)$").unwrap());
static OTHER_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\**\s*[A-Za-z_]+\s*\**\s*:(?:\s|$)").unwrap());
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*```\w*\s*$").unwrap());

/// Where the content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Llm,
    Sheet,
    Template,
}

/// A subject line and opening paragraph for one recipient.
///
/// Both fields are guaranteed non-empty; construction fails otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    row_index: usize,
    subject: String,
    opening_paragraph: String,
    source: ContentSource,
}

impl GeneratedContent {
    pub fn new(
        row_index: usize,
        subject: impl Into<String>,
        opening_paragraph: impl Into<String>,
        source: ContentSource,
    ) -> Result<Self, GenerationError> {
        let subject = subject.into();
        let opening_paragraph = opening_paragraph.into();
        if subject.trim().is_empty() {
            return Err(GenerationError::MalformedResponse("empty subject".into()));
        }
        if opening_paragraph.trim().is_empty() {
            return Err(GenerationError::MalformedResponse("empty opening paragraph".into()));
        }
        Ok(Self {
            row_index,
            subject,
            opening_paragraph,
            source,
        })
    }

    pub fn row_index(&self) -> usize {
        self.row_index
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn opening_paragraph(&self) -> &str {
        &self.opening_paragraph
    }

    pub fn source(&self) -> ContentSource {
        self.source
    }
}

/// Configuration for personalization.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Role or title the sender is pitching for.
    pub role: String,
    /// LLM temperature.
    pub temperature: f32,
    /// Max tokens for the LLM response.
    pub max_tokens: u32,
    /// Upper bound on a single generation call.
    pub timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            role: "Software Engineer Intern".to_string(),
            temperature: 0.6,
            max_tokens: 300,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Produces personalized content through an LLM provider.
pub struct PersonalizationGenerator {
    llm: Arc<dyn LlmProvider>,
    config: GeneratorConfig,
}

impl PersonalizationGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>, config: GeneratorConfig) -> Self {
        Self { llm, config }
    }

    /// Generate a subject and opening paragraph with a single LLM call.
    pub async fn generate(
        &self,
        recipient: &Recipient,
        context: &ExtractedContext,
    ) -> Result<GeneratedContent, GenerationError> {
        info!(
            company = %recipient.company_name,
            model = self.llm.model_name(),
            with_context = context.status == ExtractStatus::Ok,
            "Generating personalized opener"
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(recipient, context, &self.config.role)),
        ])
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens);

        let response = tokio::time::timeout(self.config.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.config.timeout,
            })??;

        let (subject, opener) = parse_generation(&response.content).inspect_err(|e| {
            warn!(
                company = %recipient.company_name,
                raw_response = %response.content,
                error = %e,
                "Unusable generation response"
            );
        })?;

        GeneratedContent::new(recipient.row_index, subject, opener, ContentSource::Llm)
    }

    /// Template content built without the LLM, for the fallback policy.
    pub fn fallback(&self, recipient: &Recipient, context: &ExtractedContext) -> GeneratedContent {
        let opener = fallback_opener(&recipient.company_name, &context.summary, &self.config.role);
        let phrase = extract_helper_phrase(if context.summary.is_empty() {
            &opener
        } else {
            &context.summary
        });
        debug!(company = %recipient.company_name, phrase = %phrase, "Using template content");
        GeneratedContent {
            row_index: recipient.row_index,
            subject: fallback_subject(&self.config.role, &recipient.company_name, &phrase),
            opening_paragraph: opener,
            source: ContentSource::Template,
        }
    }

    /// Content for a recipient whose sheet row already carries an opener.
    pub fn from_sheet(&self, recipient: &Recipient, opener: &str) -> Option<GeneratedContent> {
        let opener = strip_wrapping(opener);
        if opener.is_empty() {
            return None;
        }
        let phrase = extract_helper_phrase(&opener);
        Some(GeneratedContent {
            row_index: recipient.row_index,
            subject: fallback_subject(&self.config.role, &recipient.company_name, &phrase),
            opening_paragraph: opener,
            source: ContentSource::Sheet,
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You write concise, concrete, non-fluffy cold outreach copy.\n\n\
     Given a company and a short description of it, write:\n\
     1) A subject line of at most 12 words addressed to the company.\n\
     2) A 3-5 sentence opening paragraph that briefly explains what the company does, \
     mentions 1-2 specific aspects of their focus, and states why the candidate is a good fit.\n\n\
     Output STRICTLY in this format and nothing else:\n\
     SUBJECT: <subject line>\n\
     OPENER: <paragraph>"
        .to_string()
}

fn build_user_prompt(recipient: &Recipient, context: &ExtractedContext, role: &str) -> String {
    let mut prompt = String::with_capacity(256 + context.summary.len());
    prompt.push_str(&format!("Company: {}\n", recipient.company_name));
    if !recipient.website.is_empty() {
        prompt.push_str(&format!("Website: {}\n", recipient.website));
    }
    if context.status == ExtractStatus::Ok && !context.summary.is_empty() {
        prompt.push_str(&format!("Description: {}\n", context.summary));
    } else {
        prompt.push_str("Description: (none available, rely on the company name)\n");
    }
    prompt.push_str(&format!("Candidate role: {role}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse `SUBJECT:` / `OPENER:` sections into exactly one subject line and
/// one paragraph. Repeated labels keep the first occurrence.
pub fn parse_generation(raw: &str) -> Result<(String, String), GenerationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Section {
        None,
        Subject,
        Opener,
        Done,
    }

    let mut subject: Option<Vec<&str>> = None;
    let mut opener: Option<Vec<&str>> = None;
    let mut section = Section::None;

    for line in raw.lines() {
        // Fences and unknown labels close the open section; before the
        // first label they are ignored.
        if FENCE_RE.is_match(line) {
            if section != Section::None {
                section = Section::Done;
            }
            continue;
        }
        if let Some(caps) = LABEL_RE.captures(line) {
            let rest = caps.get(2).map_or("", |m| m.as_str());
            let target = match caps[1].to_lowercase().as_str() {
                "subject" => &mut subject,
                _ => &mut opener,
            };
            if target.is_some() {
                // A second copy of a section ends parsing.
                section = Section::Done;
                continue;
            }
            *target = Some(vec![rest]);
            section = if caps[1].eq_ignore_ascii_case("subject") {
                Section::Subject
            } else {
                Section::Opener
            };
            continue;
        }
        if OTHER_LABEL_RE.is_match(line) {
            if section != Section::None {
                section = Section::Done;
            }
            continue;
        }
        match section {
            Section::Subject => subject.get_or_insert_with(Vec::new).push(line),
            Section::Opener => opener.get_or_insert_with(Vec::new).push(line),
            Section::None | Section::Done => {}
        }
    }

    let subject = subject
        .and_then(|lines| {
            lines
                .into_iter()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        })
        .map(|s| strip_wrapping(&s).trim_end_matches('.').trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GenerationError::MalformedResponse("missing SUBJECT".into()))?;

    let opener = opener
        .map(|lines| lines.join(" "))
        .map(|s| strip_wrapping(&WHITESPACE_RE.replace_all(s.trim(), " ")))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GenerationError::MalformedResponse("missing OPENER".into()))?;

    Ok((subject, opener))
}

/// Remove service-added wrapping: surrounding quotes, backticks and bold
/// markers, repeatedly.
pub fn strip_wrapping(text: &str) -> String {
    const PAIRS: &[(&str, &str)] = &[
        ("\"", "\""),
        ("'", "'"),
        ("\u{201c}", "\u{201d}"),
        ("\u{2018}", "\u{2019}"),
        ("`", "`"),
        ("**", "**"),
    ];

    let mut current = text.trim();
    loop {
        let stripped = PAIRS.iter().find_map(|(open, close)| {
            let inner = current.strip_prefix(open)?.strip_suffix(close)?;
            Some(inner.trim())
        });
        match stripped {
            Some(inner) if inner.len() < current.len() => current = inner,
            _ => return current.to_string(),
        }
    }
}

// ── Template fallback ───────────────────────────────────────────────

/// Pick a short "helping with ___" phrase out of free text.
///
/// Candidates come from prepositional phrases, capitalized chunks and a
/// fixed keyword list. The winner is the one closest to three words, then
/// the shortest.
pub fn extract_helper_phrase(text: &str) -> String {
    if text.trim().is_empty() {
        return DEFAULT_HELPER_PHRASE.to_string();
    }
    let flat = WHITESPACE_RE.replace_all(text, " ");

    let mut candidates: Vec<String> = Vec::new();
    for caps in PREPOSITION_RE.captures_iter(&flat) {
        let phrase = caps[1].trim().to_lowercase();
        let phrase = NON_PHRASE_RE.replace_all(&phrase, "").to_string();
        if (3..=40).contains(&phrase.len()) {
            candidates.push(phrase);
        }
    }
    candidates.extend(
        CAPITALIZED_RE
            .captures_iter(text)
            .map(|caps| caps[1].to_lowercase()),
    );
    candidates.extend(KEYWORD_PHRASES.iter().map(|k| k.to_string()));

    let mut cleaned: Vec<String> = candidates
        .into_iter()
        .map(|c| WHITESPACE_RE.replace_all(c.trim(), " ").to_string())
        .filter(|c| (3..=40).contains(&c.len()))
        .collect();

    cleaned.sort_by_key(|c| {
        let words = c.split_whitespace().count() as i64;
        ((words - 3).abs(), c.len())
    });
    cleaned
        .into_iter()
        .next()
        .unwrap_or_else(|| DEFAULT_HELPER_PHRASE.to_string())
}

/// Opening paragraph used when no generated text is available.
pub fn fallback_opener(company: &str, summary: &str, role: &str) -> String {
    if summary.trim().is_empty() {
        format!(
            "I've been exploring the work that {company} does and I'm excited about your approach. \
             With my background in software and data analysis, I'd love to support your team as a {role}."
        )
    } else {
        let key = extract_helper_phrase(summary);
        format!(
            "I've been looking into {company} and I really like your focus on {key}. \
             Given my background in software and data analysis, I'd love to support work in this area as a {role}."
        )
    }
}

fn fallback_subject(role: &str, company: &str, phrase: &str) -> String {
    format!(
        "{} willing to help {} with {}",
        role.trim(),
        company.trim(),
        phrase.trim().trim_end_matches('.').to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::llm::provider::CompletionResponse;

    struct StubLlm {
        reply: Result<String, ()>,
        delay: Duration,
    }

    impl StubLlm {
        fn ok(reply: &str) -> Arc<dyn LlmProvider> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                }),
                Err(()) => Err(LlmError::AuthFailed {
                    provider: "stub".into(),
                }),
            }
        }
    }

    fn recipient() -> Recipient {
        Recipient {
            company_name: "Acme Capital".into(),
            website: "acme.com".into(),
            email: "ops@acme.com".into(),
            row_index: 4,
            first_line: None,
        }
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_basic_response() {
        let raw = "SUBJECT: Helping Acme scale its climate research\nOPENER: Acme backs climate founders.";
        let (subject, opener) = parse_generation(raw).unwrap();
        assert_eq!(subject, "Helping Acme scale its climate research");
        assert_eq!(opener, "Acme backs climate founders.");
    }

    #[test]
    fn parse_strips_wrapping_and_joins_paragraph() {
        let raw = "**Subject:** \"Quant help for Acme.\"\n\nOpener: \u{201c}Acme backs founders.\n\nYour grid work stands out.\u{201d}";
        let (subject, opener) = parse_generation(raw).unwrap();
        assert_eq!(subject, "Quant help for Acme");
        assert_eq!(opener, "Acme backs founders. Your grid work stands out.");
    }

    #[test]
    fn parse_keeps_first_of_repeated_sections() {
        let raw = "SUBJECT: one\nOPENER: first para\nSUBJECT: two\nOPENER: second para";
        let (subject, opener) = parse_generation(raw).unwrap();
        assert_eq!(subject, "one");
        assert_eq!(opener, "first para");
    }

    #[test]
    fn parse_ignores_code_fences() {
        let raw = "```\nSUBJECT: Helping Acme\nOPENER: Acme builds things.\n```";
        let (subject, opener) = parse_generation(raw).unwrap();
        assert_eq!(subject, "Helping Acme");
        assert_eq!(opener, "Acme builds things.");

        let raw = "```text\nSUBJECT: Hi\nOPENER: First line\nsecond line\n```\nHope this helps!";
        let (_, opener) = parse_generation(raw).unwrap();
        assert_eq!(opener, "First line second line");
    }

    #[test]
    fn parse_stops_opener_at_other_labels() {
        let raw = "SUBJECT: A\nOPENER: one\nPHRASE: quant research";
        let (subject, opener) = parse_generation(raw).unwrap();
        assert_eq!(subject, "A");
        assert_eq!(opener, "one");

        let raw = "SUBJECT: A\nNOTE: keep it short\nOPENER: one";
        let (subject, opener) = parse_generation(raw).unwrap();
        assert_eq!(subject, "A");
        assert_eq!(opener, "one");
    }

    #[test]
    fn parse_rejects_missing_or_empty_sections() {
        assert!(parse_generation("just some prose").is_err());
        assert!(parse_generation("SUBJECT: hi").is_err());
        assert!(parse_generation("SUBJECT: \"\"\nOPENER: text").is_err());
        assert!(parse_generation("SUBJECT: hi\nOPENER:   ").is_err());
    }

    #[test]
    fn strip_wrapping_nested() {
        assert_eq!(strip_wrapping("  \"'hello'\"  "), "hello");
        assert_eq!(strip_wrapping("**bold**"), "bold");
        assert_eq!(strip_wrapping("plain \"inner\" text"), "plain \"inner\" text");
    }

    // ── Heuristics ──────────────────────────────────────────────────

    #[test]
    fn helper_phrase_defaults_on_empty() {
        assert_eq!(extract_helper_phrase(""), DEFAULT_HELPER_PHRASE);
    }

    #[test]
    fn helper_phrase_prefers_three_words() {
        let phrase = extract_helper_phrase("We specialise in growth equity investing.");
        assert_eq!(phrase, "growth equity investing");
    }

    #[test]
    fn fallback_opener_mentions_company_and_role() {
        let opener = fallback_opener("Acme", "", "Data Intern");
        assert!(opener.contains("Acme"));
        assert!(opener.contains("Data Intern"));
    }

    // ── Generation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn generate_ok() {
        let generator = PersonalizationGenerator::new(
            StubLlm::ok("SUBJECT: Hello Acme\nOPENER: Acme does things."),
            GeneratorConfig::default(),
        );
        let ctx = ExtractedContext::unavailable(4);
        let content = generator.generate(&recipient(), &ctx).await.unwrap();
        assert_eq!(content.subject(), "Hello Acme");
        assert_eq!(content.opening_paragraph(), "Acme does things.");
        assert_eq!(content.row_index(), 4);
        assert_eq!(content.source(), ContentSource::Llm);
    }

    #[tokio::test]
    async fn generate_shape_is_stable_across_calls() {
        let generator = PersonalizationGenerator::new(
            StubLlm::ok("SUBJECT: A\nSUBJECT: B\nOPENER: one\nOPENER: two"),
            GeneratorConfig::default(),
        );
        let ctx = ExtractedContext::unavailable(4);
        let first = generator.generate(&recipient(), &ctx).await.unwrap();
        let second = generator.generate(&recipient(), &ctx).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.subject().contains('\n'));
    }

    #[tokio::test]
    async fn generate_service_error_has_no_content() {
        let generator = PersonalizationGenerator::new(
            Arc::new(StubLlm {
                reply: Err(()),
                delay: Duration::ZERO,
            }),
            GeneratorConfig::default(),
        );
        let err = generator
            .generate(&recipient(), &ExtractedContext::unavailable(4))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Llm(LlmError::AuthFailed { .. })));
    }

    #[tokio::test]
    async fn generate_times_out() {
        let generator = PersonalizationGenerator::new(
            Arc::new(StubLlm {
                reply: Ok("SUBJECT: x\nOPENER: y".into()),
                delay: Duration::from_millis(200),
            }),
            GeneratorConfig {
                timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let err = generator
            .generate(&recipient(), &ExtractedContext::unavailable(4))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Llm(LlmError::Timeout { .. })));
    }

    #[test]
    fn fallback_and_sheet_content_are_well_formed() {
        let generator =
            PersonalizationGenerator::new(StubLlm::ok(""), GeneratorConfig::default());
        let ctx = ExtractedContext::ok(4, "Acme focuses on Growth Equity in Europe.".into());

        let fallback = generator.fallback(&recipient(), &ctx);
        assert_eq!(fallback.source(), ContentSource::Template);
        assert!(fallback.subject().contains("Acme Capital"));
        assert!(!fallback.opening_paragraph().is_empty());

        let sheet = generator
            .from_sheet(&recipient(), "\"Loved your note on Growth Equity.\"")
            .unwrap();
        assert_eq!(sheet.source(), ContentSource::Sheet);
        assert_eq!(sheet.opening_paragraph(), "Loved your note on Growth Equity.");
        assert!(generator.from_sheet(&recipient(), "  ").is_none());
    }

    #[test]
    fn user_prompt_embeds_company_role_and_summary() {
        let ctx = ExtractedContext::ok(4, "Climate infrastructure investor".into());
        let prompt = build_user_prompt(&recipient(), &ctx, "Quant Intern");
        assert!(prompt.contains("Acme Capital"));
        assert!(prompt.contains("Quant Intern"));
        assert!(prompt.contains("Climate infrastructure investor"));

        let prompt = build_user_prompt(&recipient(), &ExtractedContext::unavailable(4), "Quant Intern");
        assert!(prompt.contains("none available"));
    }
}
