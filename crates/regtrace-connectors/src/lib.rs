use std::time::Duration;

use regtrace_core::{EngineError, EngineResult, RegulationDraft, RegulationId, SourceSystem};
use time::{Date, Month, OffsetDateTime};

pub const DEFAULT_FEDERAL_REGISTER_BASE_URL: &str = "https://www.federalregister.gov/api/v1";
pub const DEFAULT_EUR_LEX_BASE_URL: &str = "https://eur-lex.europa.eu";

/// Topic-search results below this usable-text floor are skipped as noise
/// (listing stubs without a body).
const MIN_TOPIC_TEXT_LEN: usize = 150;
/// A CELEX page whose extracted text is shorter than this did not resolve to
/// a usable legal text.
const MIN_CELEX_TEXT_LEN: usize = 500;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            user_agent: "RegTrace/0.1 (regulatory traceability engine)".to_string(),
        }
    }
}

fn build_agent(config: &ConnectorConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(config.timeout)
        .user_agent(&config.user_agent)
        .build()
}

fn upstream_error(source: &str, err: &ureq::Error) -> EngineError {
    match err {
        ureq::Error::Status(code, _) => {
            EngineError::UpstreamUnavailable(format!("{source} returned HTTP {code}"))
        }
        ureq::Error::Transport(transport) => {
            EngineError::UpstreamUnavailable(format!("{source} transport failure: {transport}"))
        }
    }
}

/// Parse a `YYYY-MM-DD` date into a UTC midnight instant.
fn parse_publication_date(value: &str) -> Option<OffsetDateTime> {
    let mut parts = value.splitn(3, '-');
    let year = parts.next()?.parse::<i32>().ok()?;
    let month = parts.next()?.parse::<u8>().ok()?;
    let day = parts.next()?.parse::<u8>().ok()?;

    let month = Month::try_from(month).ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    Some(date.midnight().assume_utc())
}

/// Topic-indexed connector for the US federal-register style search API.
/// Fetch-only: committing drafts is the caller's explicit step, so a failed
/// commit after a successful fetch is safely retryable.
#[derive(Clone)]
pub struct FederalRegisterConnector {
    base_url: String,
    agent: ureq::Agent,
}

impl FederalRegisterConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>, config: &ConnectorConfig) -> Self {
        Self { base_url: base_url.into(), agent: build_agent(config) }
    }

    /// Search recent documents for a topic and normalize them into drafts.
    ///
    /// An empty result set is not an error.
    ///
    /// # Errors
    /// Returns [`EngineError::UpstreamUnavailable`] on transport failure,
    /// timeout, or a non-success upstream status.
    pub fn import_by_topic(&self, topic: &str, limit: u32) -> EngineResult<Vec<RegulationDraft>> {
        let url = format!("{}/documents.json", self.base_url);
        let response = self
            .agent
            .get(&url)
            .query("per_page", &limit.to_string())
            .query("order", "newest")
            .query("conditions[term]", topic)
            .call()
            .map_err(|err| upstream_error("federal register search", &err))?;

        let body: serde_json::Value = response
            .into_json()
            .map_err(|err| EngineError::UpstreamUnavailable(format!(
                "federal register search returned unreadable JSON: {err}"
            )))?;

        let drafts = parse_topic_response(&body, OffsetDateTime::now_utc());
        tracing::info!(topic, fetched = drafts.len(), "federal register topic search completed");
        Ok(drafts)
    }
}

/// Normalize a topic-search response body into regulation drafts. Documents
/// without a number or with less than the minimum usable text are skipped.
#[must_use]
pub fn parse_topic_response(
    body: &serde_json::Value,
    fetched_at: OffsetDateTime,
) -> Vec<RegulationDraft> {
    let Some(results) = body.get("results").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };

    let mut drafts = Vec::new();
    for document in results {
        let Some(number) = document.get("document_number").and_then(serde_json::Value::as_str)
        else {
            continue;
        };

        let text = ["body_text", "body_html", "abstract"]
            .iter()
            .find_map(|field| document.get(*field).and_then(serde_json::Value::as_str))
            .unwrap_or("");
        if text.trim().len() < MIN_TOPIC_TEXT_LEN {
            continue;
        }

        let title = document
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("Federal Rule");
        let published_at = document
            .get("publication_date")
            .and_then(serde_json::Value::as_str)
            .and_then(parse_publication_date)
            .unwrap_or(fetched_at);
        let url = document
            .get("html_url")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);

        drafts.push(RegulationDraft {
            id: RegulationId::new(format!("US-FR-{number}")),
            country: "USA".to_string(),
            source: SourceSystem::FederalRegister,
            title: title.to_string(),
            published_at,
            text: text.trim().to_string(),
            url,
        });
    }

    drafts
}

/// Identifier-lookup connector for the EU legal-database CELEX pages.
#[derive(Clone)]
pub struct EurLexConnector {
    base_url: String,
    agent: ureq::Agent,
}

impl EurLexConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>, config: &ConnectorConfig) -> Self {
        Self { base_url: base_url.into(), agent: build_agent(config) }
    }

    /// Fetch one legal text by exact CELEX identifier.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier does not resolve
    /// (HTTP 404, or a page without a usable text body), and
    /// [`EngineError::UpstreamUnavailable`] on transport failure or timeout.
    pub fn import_by_identifier(&self, celex_id: &str) -> EngineResult<RegulationDraft> {
        let celex_id = celex_id.trim();
        if celex_id.is_empty() {
            return Err(EngineError::not_found("empty CELEX identifier"));
        }

        let url = format!("{}/legal-content/EN/TXT/?uri=CELEX:{celex_id}", self.base_url);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => {
                return Err(EngineError::NotFound(format!(
                    "CELEX identifier {celex_id} does not resolve"
                )));
            }
            Err(err) => return Err(upstream_error("eur-lex lookup", &err)),
        };

        let html = response.into_string().map_err(|err| {
            EngineError::UpstreamUnavailable(format!("eur-lex response unreadable: {err}"))
        })?;

        let draft = draft_from_celex_html(celex_id, url, &html, OffsetDateTime::now_utc())?;
        tracing::info!(celex_id, chars = draft.text.len(), "eur-lex lookup completed");
        Ok(draft)
    }
}

/// Build a draft from a fetched CELEX HTML page.
///
/// # Errors
/// Returns [`EngineError::NotFound`] when the page's visible text is below
/// the usable floor — the identifier resolved to a stub, not a legal text.
pub fn draft_from_celex_html(
    celex_id: &str,
    url: String,
    html: &str,
    fetched_at: OffsetDateTime,
) -> EngineResult<RegulationDraft> {
    let text = html_to_text(html);
    if text.len() < MIN_CELEX_TEXT_LEN {
        return Err(EngineError::NotFound(format!(
            "CELEX identifier {celex_id} resolved to no usable text"
        )));
    }

    let title = html_title(html).unwrap_or_else(|| format!("EU Regulation {celex_id}"));

    Ok(RegulationDraft {
        id: RegulationId::new(format!("EU-{celex_id}")),
        country: "EU".to_string(),
        source: SourceSystem::EurLex,
        title,
        published_at: fetched_at,
        text,
        url: Some(url),
    })
}

/// Reduce an HTML document to its visible text: script/style bodies dropped,
/// tags stripped, common entities decoded, whitespace collapsed.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len() / 2);
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'<' {
            if let Some(skip_to) = skip_raw_element(&lower, index) {
                index = skip_to;
                continue;
            }
            match lower[index..].find('>') {
                Some(close) => index += close + 1,
                None => break,
            }
            // block boundaries become whitespace so words do not fuse
            out.push(' ');
            continue;
        }

        let Some(next_tag) = lower[index..].find('<') else {
            out.push_str(&html[index..]);
            break;
        };
        out.push_str(&html[index..index + next_tag]);
        index += next_tag;
    }

    collapse_whitespace(&decode_entities(&out))
}

/// Skip `<script>` / `<style>` elements entirely, body included. Returns the
/// byte offset just past the closing tag, if the element starts at `index`.
fn skip_raw_element(lower: &str, index: usize) -> Option<usize> {
    for (open, close) in [("<script", "</script>"), ("<style", "</style>")] {
        if lower[index..].starts_with(open) {
            return match lower[index..].find(close) {
                Some(end) => Some(index + end + close.len()),
                None => Some(lower.len()),
            };
        }
    }
    None
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !previous_was_space {
                out.push(' ');
            }
            previous_was_space = true;
        } else {
            out.push(ch);
            previous_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Extract the page title: the first `<h1>` body, else `<title>`.
#[must_use]
pub fn html_title(html: &str) -> Option<String> {
    for tag in ["h1", "title"] {
        if let Some(body) = tag_body(html, tag) {
            let text = collapse_whitespace(&decode_entities(&html_to_text(&body)));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn tag_body(html: &str, tag: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open_at = lower.find(&format!("<{tag}"))?;
    let content_at = open_at + lower[open_at..].find('>')? + 1;
    let close_at = content_at + lower[content_at..].find(&format!("</{tag}>"))?;
    Some(html[content_at..close_at].to_string())
}
