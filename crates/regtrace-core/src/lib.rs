use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    UpstreamUnavailable,
    ExtractionFailed,
    Busy,
    Conflict,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ExtractionFailed => "extraction_failed",
            Self::Busy => "busy",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("operation already in flight: {0}")]
    Busy(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn internal(err: impl Display) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RegulationId(pub String);

impl RegulationId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RegulationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RequirementId(pub String);

impl RequirementId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequirementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    FederalRegister,
    EurLex,
    Manual,
}

impl SourceSystem {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FederalRegister => "federal_register",
            Self::EurLex => "eur_lex",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "federal_register" => Some(Self::FederalRegister),
            "eur_lex" => Some(Self::EurLex),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Imported,
    ReVersioned,
    Extracted,
    ReExtracted,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::ReVersioned => "re-versioned",
            Self::Extracted => "extracted",
            Self::ReExtracted => "re-extracted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "imported" => Some(Self::Imported),
            "re-versioned" => Some(Self::ReVersioned),
            "extracted" => Some(Self::Extracted),
            "re-extracted" => Some(Self::ReExtracted),
            _ => None,
        }
    }
}

/// A fetched, not-yet-committed regulatory text. Connectors produce drafts;
/// only the store's ingest turns one into a versioned `Regulation`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegulationDraft {
    pub id: RegulationId,
    pub country: String,
    pub source: SourceSystem,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub text: String,
    pub url: Option<String>,
}

impl RegulationDraft {
    /// # Errors
    /// Returns [`EngineError::Internal`] when identity or content fields are blank.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(EngineError::internal("regulation id MUST be non-empty"));
        }
        if self.title.trim().is_empty() {
            return Err(EngineError::internal("regulation title MUST be non-empty"));
        }
        if self.text.trim().is_empty() {
            return Err(EngineError::internal("regulation text MUST be non-empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_text(&self.text)
    }
}

/// One committed, immutable version of a regulatory text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Regulation {
    pub id: RegulationId,
    pub version: u32,
    pub country: String,
    pub source: SourceSystem,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub fingerprint: String,
    pub text: String,
    pub url: Option<String>,
}

impl Regulation {
    /// # Errors
    /// Returns [`EngineError::Internal`] when version, identity, or fingerprint
    /// invariants are violated.
    pub fn validate(&self) -> EngineResult<()> {
        if self.version == 0 {
            return Err(EngineError::internal("version MUST be >= 1"));
        }
        if self.id.as_str().trim().is_empty() {
            return Err(EngineError::internal("regulation id MUST be non-empty"));
        }
        if self.text.trim().is_empty() {
            return Err(EngineError::internal("regulation text MUST be non-empty"));
        }
        if !self.fingerprint.starts_with("sha256:") || self.fingerprint.len() <= 7 {
            return Err(EngineError::internal("fingerprint MUST be formatted as sha256:<hex>"));
        }
        Ok(())
    }
}

/// An engineering-actionable statement derived from one regulation version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementRecord {
    pub id: RequirementId,
    pub regulation_id: RegulationId,
    pub regulation_version: u32,
    pub seq: u32,
    pub text_raw: String,
    pub text_engineering: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The computed effect of one requirement on the product. Sets are sorted and
/// deduplicated so identical inputs serialize byte-identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImpactAssessment {
    pub requirement_id: RequirementId,
    pub model_version: String,
    pub components: Vec<String>,
    pub tests: Vec<String>,
    pub documents: Vec<String>,
}

impl ImpactAssessment {
    #[must_use]
    pub fn is_unmatched(&self) -> bool {
        self.components.is_empty() && self.tests.is_empty() && self.documents.is_empty()
    }
}

/// One immutable audit record. Sequence numbers are assigned at append time
/// and break timestamp ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub subject_id: String,
    pub subject_version: u32,
    pub change: ChangeKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryFilter {
    pub subject_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub until: Option<OffsetDateTime>,
}

#[must_use]
pub fn fingerprint_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    format!("sha256:{digest:x}")
}

/// Clause segmentation policy. The heuristic behind extraction is isolated
/// here so it can be swapped without touching orchestration or idempotence.
pub trait Segmenter {
    fn segment(&self, text: &str) -> Vec<String>;
}

/// Sentence-level segmentation: terminal punctuation is normalized to `.`,
/// the text is split on it, and blank fragments are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentenceSegmenter;

impl Segmenter for SentenceSegmenter {
    fn segment(&self, text: &str) -> Vec<String> {
        text.replace(['?', '!'], ".")
            .split('.')
            .map(str::trim)
            .filter(|clause| !clause.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

const OBLIGATION_MARKERS: &[&str] =
    &["shall", "must", "doit", "doivent", "required", "obligatoire"];

const ENGINEERING_REWRITES: &[(&str, &str)] = &[
    ("Manufacturers shall", "The engineering team must"),
    ("The manufacturer shall", "The engineering team must"),
    ("Manufacturers must", "The engineering team must"),
    ("Les constructeurs doivent", "L'equipe d'ingenierie doit"),
    ("shall", "must"),
];

/// Heuristic actionability filter: a clause is retained iff it carries an
/// obligation marker. Pure definitions and preambles fall out. This is a
/// documented heuristic, not a guaranteed-correct classification.
#[must_use]
pub fn is_actionable(clause: &str) -> bool {
    let lowered = clause.to_lowercase();
    OBLIGATION_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Rewrite a retained legal clause into an imperative engineering statement.
/// The rewrite table is ordered; identical input always yields identical
/// output.
#[must_use]
pub fn to_engineering(clause: &str) -> String {
    let mut text = clause.trim().to_string();
    for (legal, engineering) in ENGINEERING_REWRITES {
        text = text.replace(legal, engineering);
    }
    if !text.ends_with('.') {
        text.push('.');
    }
    text
}

/// Derive the deterministic identifier of the `seq`-th requirement extracted
/// from one regulation version.
#[must_use]
pub fn requirement_id(regulation_id: &RegulationId, version: u32, seq: u32) -> RequirementId {
    RequirementId::new(format!("{regulation_id}-v{version}-R{seq:03}"))
}

/// Derive requirement records from one regulation version's raw text.
///
/// Record identifiers are position-derived, so extracting the same text twice
/// reproduces the same ids and the same content.
///
/// # Errors
/// Returns [`EngineError::ExtractionFailed`] when non-blank input segments to
/// zero candidate clauses. Zero *actionable* clauses out of a non-empty
/// candidate list is a valid empty result, not an error.
pub fn extract_requirements(
    regulation: &Regulation,
    segmenter: &dyn Segmenter,
    extracted_at: OffsetDateTime,
) -> EngineResult<Vec<RequirementRecord>> {
    if regulation.text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let clauses = segmenter.segment(&regulation.text);
    if clauses.is_empty() {
        return Err(EngineError::ExtractionFailed(format!(
            "no candidate clauses could be segmented from regulation {} version {}",
            regulation.id, regulation.version
        )));
    }

    let mut records = Vec::new();
    let mut seq = 0_u32;
    for clause in clauses {
        if !is_actionable(&clause) {
            continue;
        }
        seq += 1;
        records.push(RequirementRecord {
            id: requirement_id(&regulation.id, regulation.version, seq),
            regulation_id: regulation.id.clone(),
            regulation_version: regulation.version,
            seq,
            text_raw: clause.clone(),
            text_engineering: to_engineering(&clause),
            created_at: extracted_at,
        });
    }

    tracing::debug!(
        regulation = %regulation.id,
        version = regulation.version,
        retained = records.len(),
        "segmented and filtered regulation text"
    );

    Ok(records)
}

/// Two requirement sets are content-equal when they carry the same
/// `(text_raw, text_engineering)` multiset, regardless of extraction time.
#[must_use]
pub fn requirement_sets_equal(lhs: &[RequirementRecord], rhs: &[RequirementRecord]) -> bool {
    fn content(records: &[RequirementRecord]) -> Vec<(&str, &str)> {
        let mut pairs = records
            .iter()
            .map(|record| (record.text_raw.as_str(), record.text_engineering.as_str()))
            .collect::<Vec<_>>();
        pairs.sort_unstable();
        pairs
    }

    content(lhs) == content(rhs)
}

/// One keyword bucket of the cross-reference model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrossrefRule {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub documents: Vec<String>,
}

/// Versioned mapping from requirement content to affected product artifacts.
/// This is configuration data with lookup semantics; resolution never
/// branches on anything but the table itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrossrefModel {
    pub version: String,
    pub rules: Vec<CrossrefRule>,
}

impl CrossrefModel {
    /// The compiled-in default table: the automotive mapping the product
    /// teams started from. Deployments override it with a YAML file.
    #[must_use]
    pub fn builtin() -> Self {
        fn strings(values: &[&str]) -> Vec<String> {
            values.iter().map(ToString::to_string).collect()
        }

        Self {
            version: "crossref.v1".to_string(),
            rules: vec![
                CrossrefRule {
                    keywords: strings(&["battery", "batterie"]),
                    components: strings(&["BAT_PACK", "BMS"]),
                    tests: strings(&["TEST_DURABILITY_CYCLES"]),
                    documents: strings(&["SPEC_BATTERY_DURABILITY"]),
                },
                CrossrefRule {
                    keywords: strings(&["traceab", "tra\u{e7}abil"]),
                    components: strings(&["BAT_PACK"]),
                    tests: strings(&["TEST_TRACEABILITY"]),
                    documents: strings(&["SPEC_BATTERY_PASSPORT"]),
                },
                CrossrefRule {
                    keywords: strings(&["cyber", "csms"]),
                    components: strings(&["TCU"]),
                    tests: strings(&["TEST_CSMS_PROCESS"]),
                    documents: strings(&["CYBERSECURITY_PLAN"]),
                },
                CrossrefRule {
                    keywords: strings(&["software", "update", "ota", "sums"]),
                    components: strings(&["TCU", "UPDATE_SERVER"]),
                    tests: strings(&["TEST_SUMS_PROCESS"]),
                    documents: strings(&["SUMS_PLAN"]),
                },
                CrossrefRule {
                    keywords: strings(&["crash", "choc \u{e9}lectrique", "hv"]),
                    components: strings(&["BAT_PACK", "HV_DISCONNECT"]),
                    tests: strings(&["TEST_CRASH_ISOLATION"]),
                    documents: strings(&["SPEC_HV_ISOLATION"]),
                },
            ],
        }
    }

    /// # Errors
    /// Returns [`EngineError::Internal`] when the model version is blank, a
    /// rule has no keywords, or a keyword is not lowercase (matching is
    /// case-insensitive by construction, so the table must be lowercase).
    pub fn validate(&self) -> EngineResult<()> {
        if self.version.trim().is_empty() {
            return Err(EngineError::internal("cross-reference model version MUST be non-empty"));
        }
        for rule in &self.rules {
            if rule.keywords.is_empty() {
                return Err(EngineError::internal(
                    "cross-reference rule MUST carry at least one keyword",
                ));
            }
            for keyword in &rule.keywords {
                if keyword.trim().is_empty() {
                    return Err(EngineError::internal(
                        "cross-reference keyword MUST be non-empty",
                    ));
                }
                if *keyword != keyword.to_lowercase() {
                    return Err(EngineError::Internal(format!(
                        "cross-reference keyword MUST be lowercase: {keyword}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the artifacts affected by one requirement. A requirement with
    /// no keyword hits yields all-empty sets; that is a valid outcome,
    /// distinct from a missing requirement.
    #[must_use]
    pub fn resolve(&self, requirement: &RequirementRecord) -> ImpactAssessment {
        let haystack =
            format!("{} {}", requirement.text_raw, requirement.text_engineering).to_lowercase();

        let mut components = BTreeSet::new();
        let mut tests = BTreeSet::new();
        let mut documents = BTreeSet::new();

        for rule in &self.rules {
            if !rule.keywords.iter().any(|keyword| haystack.contains(keyword.as_str())) {
                continue;
            }
            components.extend(rule.components.iter().cloned());
            tests.extend(rule.tests.iter().cloned());
            documents.extend(rule.documents.iter().cloned());
        }

        ImpactAssessment {
            requirement_id: requirement.id.clone(),
            model_version: self.version.clone(),
            components: components.into_iter().collect(),
            tests: tests.into_iter().collect(),
            documents: documents.into_iter().collect(),
        }
    }
}
