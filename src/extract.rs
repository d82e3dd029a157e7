//! Context extractor — turns a company website into a short text blurb.
//!
//! Extraction never fails the recipient. Any network, status or parsing
//! problem is downgraded to [`ExtractStatus::Unavailable`] (or `Error` for
//! a reference that is not a URL) and the pipeline proceeds with the
//! company name alone.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::recipients::Recipient;

/// User-Agent string for site fetches.
const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; bulk-outreach/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Pages tried after the homepage, in order.
const CANDIDATE_PATHS: &[&str] = &["/about", "/about-us", "/company"];

/// Fragments shorter than this are navigation noise.
const MIN_FRAGMENT_CHARS: usize = 40;

/// Default bound on the summary handed to the generator.
pub const DEFAULT_MAX_SUMMARY_CHARS: usize = 1200;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Outcome of an extraction attempt. Neither `Unavailable` nor `Error`
/// stops the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStatus {
    Ok,
    Unavailable,
    Error,
}

/// Text context for one recipient.
#[derive(Debug, Clone)]
pub struct ExtractedContext {
    pub row_index: usize,
    pub summary: String,
    pub status: ExtractStatus,
}

impl ExtractedContext {
    pub fn ok(row_index: usize, summary: String) -> Self {
        Self {
            row_index,
            summary,
            status: ExtractStatus::Ok,
        }
    }

    pub fn unavailable(row_index: usize) -> Self {
        Self {
            row_index,
            summary: String::new(),
            status: ExtractStatus::Unavailable,
        }
    }

    /// The reference itself is unusable. Treated downstream like
    /// `Unavailable`.
    pub fn malformed(row_index: usize) -> Self {
        Self {
            row_index,
            summary: String::new(),
            status: ExtractStatus::Error,
        }
    }
}

/// Source of contextual signal about a recipient.
#[async_trait]
pub trait ContextExtractor: Send + Sync {
    async fn extract(&self, recipient: &Recipient) -> ExtractedContext;
}

// ── Web extractor ───────────────────────────────────────────────────

/// Extractor configuration.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum characters in the returned summary.
    pub max_summary_chars: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            max_summary_chars: DEFAULT_MAX_SUMMARY_CHARS,
        }
    }
}

/// Fetches the homepage and common "about" pages over HTTP and keeps the
/// meta description and first paragraph.
pub struct WebExtractor {
    client: Client,
    config: ExtractorConfig,
}

impl WebExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Fetch one page, returning its HTML only for a 200 `text/html` response.
    async fn fetch_html(&self, url: &Url) -> Option<String> {
        let response = match self.client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(%url, error = %e, "Fetch failed");
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            debug!(%url, status = %response.status(), "Non-200 response");
            return None;
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));
        if !is_html {
            debug!(%url, "Skipping non-HTML response");
            return None;
        }

        response.text().await.ok()
    }
}

#[async_trait]
impl ContextExtractor for WebExtractor {
    async fn extract(&self, recipient: &Recipient) -> ExtractedContext {
        if recipient.website.trim().is_empty() {
            debug!(row = recipient.row_index, "No website reference");
            return ExtractedContext::unavailable(recipient.row_index);
        }
        let Some(base) = normalize_site(&recipient.website) else {
            warn!(
                row = recipient.row_index,
                website = %recipient.website,
                "Website reference is not a valid URL"
            );
            return ExtractedContext::malformed(recipient.row_index);
        };

        for url in candidate_urls(&base) {
            let Some(html) = self.fetch_html(&url).await else {
                continue;
            };
            let summary = summarize_html(&html, self.config.max_summary_chars);
            if !summary.is_empty() {
                info!(
                    company = %recipient.company_name,
                    %url,
                    chars = summary.chars().count(),
                    "Extracted site context"
                );
                return ExtractedContext::ok(recipient.row_index, summary);
            }
        }

        debug!(company = %recipient.company_name, "No usable site context");
        ExtractedContext::unavailable(recipient.row_index)
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Parse a website reference, adding `http://` to bare domains.
pub fn normalize_site(website: &str) -> Option<Url> {
    let trimmed = website.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    Url::parse(&with_scheme).ok()
}

/// The homepage followed by the common about pages.
pub fn candidate_urls(base: &Url) -> Vec<Url> {
    let mut urls = vec![base.clone()];
    urls.extend(CANDIDATE_PATHS.iter().filter_map(|path| base.join(path).ok()));
    urls
}

/// Reduce a page to its meta description and first paragraph, stripped of
/// markup, whitespace-collapsed and truncated to `max_chars`.
pub fn summarize_html(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let mut fragments = Vec::new();

    if let Ok(meta) = Selector::parse(r#"meta[name="description"]"#)
        && let Some(content) = doc
            .select(&meta)
            .next()
            .and_then(|el| el.value().attr("content"))
    {
        fragments.push(content.trim().to_string());
    }

    if let Ok(p) = Selector::parse("p")
        && let Some(el) = doc.select(&p).next()
    {
        fragments.push(el.text().collect::<Vec<_>>().join(" "));
    }

    let joined = fragments
        .iter()
        .map(|f| f.trim())
        .filter(|f| f.chars().count() > MIN_FRAGMENT_CHARS)
        .collect::<Vec<_>>()
        .join(" ");

    let collapsed = WHITESPACE_RE.replace_all(joined.trim(), " ");
    collapsed.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const DESCRIPTION: &str = "Acme Capital backs early-stage climate infrastructure across Europe.";

    fn recipient(website: &str) -> Recipient {
        Recipient {
            company_name: "Acme".into(),
            website: website.into(),
            email: "ops@acme.com".into(),
            row_index: 0,
            first_line: None,
        }
    }

    fn html_page(description: &str, paragraph: &str) -> String {
        format!(
            "<html><head><meta name=\"description\" content=\"{description}\"></head>\
             <body><nav>Home</nav><p>{paragraph}</p><p>second</p></body></html>"
        )
    }

    #[test]
    fn normalize_adds_scheme() {
        assert_eq!(normalize_site("acme.com").unwrap().as_str(), "http://acme.com/");
        assert_eq!(
            normalize_site("https://acme.com/x").unwrap().as_str(),
            "https://acme.com/x"
        );
        assert!(normalize_site("   ").is_none());
    }

    #[test]
    fn candidates_include_about_pages() {
        let base = Url::parse("https://acme.com/").unwrap();
        let urls: Vec<String> = candidate_urls(&base).iter().map(|u| u.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://acme.com/",
                "https://acme.com/about",
                "https://acme.com/about-us",
                "https://acme.com/company",
            ]
        );
    }

    #[test]
    fn summarize_keeps_meta_and_first_paragraph() {
        let html = html_page(
            DESCRIPTION,
            "We   partner with\n founders building grid storage and clean transport.",
        );
        let summary = summarize_html(&html, DEFAULT_MAX_SUMMARY_CHARS);
        assert!(summary.starts_with(DESCRIPTION));
        assert!(summary.contains("We partner with founders building grid storage"));
        assert!(!summary.contains("second"));
        assert!(!summary.contains('<'));
    }

    #[test]
    fn summarize_drops_short_fragments() {
        let html = html_page("Short.", "Tiny.");
        assert_eq!(summarize_html(&html, DEFAULT_MAX_SUMMARY_CHARS), "");
    }

    #[test]
    fn summarize_truncates() {
        let long = "x".repeat(5000);
        let html = html_page(&long, "");
        assert_eq!(summarize_html(&html, 100).chars().count(), 100);
    }

    #[tokio::test]
    async fn empty_website_is_unavailable() {
        let extractor = WebExtractor::new(ExtractorConfig::default()).unwrap();
        let ctx = extractor.extract(&recipient("")).await;
        assert_eq!(ctx.status, ExtractStatus::Unavailable);
        assert!(ctx.summary.is_empty());
    }

    #[tokio::test]
    async fn malformed_website_is_error_status() {
        let extractor = WebExtractor::new(ExtractorConfig::default()).unwrap();
        let ctx = extractor.extract(&recipient("http://exa mple.com")).await;
        assert_eq!(ctx.status, ExtractStatus::Error);
        assert!(ctx.summary.is_empty());
    }

    #[tokio::test]
    async fn extracts_from_homepage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(html_page(DESCRIPTION, "")),
            )
            .mount(&server)
            .await;

        let extractor = WebExtractor::new(ExtractorConfig::default()).unwrap();
        let ctx = extractor.extract(&recipient(&server.uri())).await;
        assert_eq!(ctx.status, ExtractStatus::Ok);
        assert_eq!(ctx.summary, DESCRIPTION);
    }

    #[tokio::test]
    async fn falls_back_to_about_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/about"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(html_page(DESCRIPTION, "")),
            )
            .mount(&server)
            .await;

        let extractor = WebExtractor::new(ExtractorConfig::default()).unwrap();
        let ctx = extractor.extract(&recipient(&server.uri())).await;
        assert_eq!(ctx.status, ExtractStatus::Ok);
        assert_eq!(ctx.summary, DESCRIPTION);
    }

    #[tokio::test]
    async fn non_html_and_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;
        // Everything else 404s by default.

        let extractor = WebExtractor::new(ExtractorConfig::default()).unwrap();
        let ctx = extractor.extract(&recipient(&server.uri())).await;
        assert_eq!(ctx.status, ExtractStatus::Unavailable);
    }

    #[tokio::test]
    async fn timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(html_page(DESCRIPTION, ""))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let extractor = WebExtractor::new(ExtractorConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();
        let ctx = extractor.extract(&recipient(&server.uri())).await;
        assert_eq!(ctx.status, ExtractStatus::Unavailable);
    }
}
