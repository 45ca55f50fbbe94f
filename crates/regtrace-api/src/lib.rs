use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regtrace_connectors::{
    ConnectorConfig, EurLexConnector, FederalRegisterConnector, DEFAULT_EUR_LEX_BASE_URL,
    DEFAULT_FEDERAL_REGISTER_BASE_URL,
};
use regtrace_core::{
    extract_requirements, CrossrefModel, EngineError, EngineResult, HistoryEntry, HistoryFilter,
    ImpactAssessment, Regulation, RegulationDraft, RegulationId, RequirementId,
    RequirementRecord, SentenceSegmenter, SourceSystem,
};
use regtrace_store_sqlite::{ExtractionStatus, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub crossref_path: Option<PathBuf>,
    pub federal_register_base_url: String,
    pub eur_lex_base_url: String,
    pub upstream_timeout: Duration,
}

impl EngineConfig {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            crossref_path: None,
            federal_register_base_url: DEFAULT_FEDERAL_REGISTER_BASE_URL.to_string(),
            eur_lex_base_url: DEFAULT_EUR_LEX_BASE_URL.to_string(),
            upstream_timeout: Duration::from_secs(12),
        }
    }
}

/// Latest-version listing row: everything the presentation layer renders in
/// tables, without the raw text body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegulationSummary {
    pub id: RegulationId,
    pub version: u32,
    pub country: String,
    pub source: SourceSystem,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub url: Option<String>,
}

impl From<&Regulation> for RegulationSummary {
    fn from(regulation: &Regulation) -> Self {
        Self {
            id: regulation.id.clone(),
            version: regulation.version,
            country: regulation.country.clone(),
            source: regulation.source,
            title: regulation.title.clone(),
            published_at: regulation.published_at,
            url: regulation.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegulationQuery {
    pub country: Option<String>,
    pub source: Option<SourceSystem>,
    pub q: Option<String>,
}

/// Outcome of one topic import: how many fetched drafts landed as new
/// versions versus fingerprint no-ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub fetched: usize,
    pub created: usize,
    pub re_versioned: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportedRegulation {
    pub regulation: Regulation,
    pub is_new_version: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractResult {
    pub regulation_id: RegulationId,
    pub regulation_version: u32,
    pub status: ExtractionStatus,
    pub records: Vec<RequirementRecord>,
}

/// Process-wide single-flight guard for extraction runs, keyed by
/// `(regulation, version)`. A second concurrent caller fails fast with
/// `Busy` instead of running a duplicate extraction.
#[derive(Default)]
struct ExtractionGuard {
    in_flight: Mutex<BTreeSet<String>>,
}

impl ExtractionGuard {
    fn acquire(self: &Arc<Self>, key: String) -> EngineResult<ExtractionPermit> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| EngineError::internal("extraction guard lock poisoned"))?;
        if !in_flight.insert(key.clone()) {
            return Err(EngineError::Busy(format!("extraction already in flight for {key}")));
        }
        Ok(ExtractionPermit { guard: Arc::clone(self), key })
    }
}

struct ExtractionPermit {
    guard: Arc<ExtractionGuard>,
    key: String,
}

impl Drop for ExtractionPermit {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.guard.in_flight.lock() {
            in_flight.remove(&self.key);
        }
    }
}

/// The operations the façade and the CLI both consume. One store is opened
/// (and migrated) per operation; cross-operation state is limited to the
/// immutable cross-reference model and the extraction guard.
#[derive(Clone)]
pub struct TraceabilityApi {
    db_path: PathBuf,
    crossref: CrossrefModel,
    federal_register: FederalRegisterConnector,
    eur_lex: EurLexConnector,
    extraction_guard: Arc<ExtractionGuard>,
}

impl TraceabilityApi {
    /// Build an engine handle: loads and validates the cross-reference model
    /// (file-backed when configured, compiled-in default otherwise) and wires
    /// the upstream connectors.
    ///
    /// # Errors
    /// Returns an error when the cross-reference model file cannot be read,
    /// parsed, or validated.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let crossref = match &config.crossref_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    EngineError::Internal(format!(
                        "failed to read cross-reference model {}: {err}",
                        path.display()
                    ))
                })?;
                let model: CrossrefModel = serde_yaml::from_str(&text).map_err(|err| {
                    EngineError::Internal(format!(
                        "failed to parse cross-reference model {}: {err}",
                        path.display()
                    ))
                })?;
                model.validate()?;
                model
            }
            None => CrossrefModel::builtin(),
        };

        let connector_config = ConnectorConfig {
            timeout: config.upstream_timeout,
            ..ConnectorConfig::default()
        };

        Ok(Self {
            db_path: config.db_path.clone(),
            crossref,
            federal_register: FederalRegisterConnector::new(
                config.federal_register_base_url.clone(),
                &connector_config,
            ),
            eur_lex: EurLexConnector::new(config.eur_lex_base_url.clone(), &connector_config),
            extraction_guard: Arc::new(ExtractionGuard::default()),
        })
    }

    #[must_use]
    pub fn crossref_model_version(&self) -> &str {
        &self.crossref.version
    }

    fn open_store(&self) -> EngineResult<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> EngineResult<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Topic-based import: fetch drafts from the US registry, then commit
    /// each one through the store's idempotent ingest.
    ///
    /// # Errors
    /// Returns [`EngineError::UpstreamUnavailable`] when the registry is
    /// unreachable; nothing is persisted in that case.
    pub fn import_us(&self, topic: &str, limit: u32) -> EngineResult<ImportSummary> {
        let drafts = self.federal_register.import_by_topic(topic, limit)?;
        let mut store = self.open_store()?;

        let mut summary = ImportSummary { fetched: drafts.len(), ..ImportSummary::default() };
        for draft in &drafts {
            let (regulation, is_new_version) = store.ingest(draft)?;
            if !is_new_version {
                summary.unchanged += 1;
            } else if regulation.version == 1 {
                summary.created += 1;
            } else {
                summary.re_versioned += 1;
            }
        }

        tracing::info!(
            topic,
            fetched = summary.fetched,
            created = summary.created,
            re_versioned = summary.re_versioned,
            "topic import completed"
        );
        Ok(summary)
    }

    /// Identifier-based import: fetch one CELEX text and commit it.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier does not resolve
    /// and [`EngineError::UpstreamUnavailable`] on transport failure.
    pub fn import_eu(&self, celex_id: &str) -> EngineResult<ImportedRegulation> {
        let draft = self.eur_lex.import_by_identifier(celex_id)?;
        self.ingest_draft(&draft)
    }

    /// Commit one already-fetched draft (the manual source path).
    ///
    /// # Errors
    /// Propagates store ingest failures.
    pub fn ingest_draft(&self, draft: &RegulationDraft) -> EngineResult<ImportedRegulation> {
        let mut store = self.open_store()?;
        let (regulation, is_new_version) = store.ingest(draft)?;
        Ok(ImportedRegulation { regulation, is_new_version })
    }

    /// Latest-version summaries, optionally filtered.
    ///
    /// # Errors
    /// Propagates store read failures.
    pub fn list_regulations(&self, query: &RegulationQuery) -> EngineResult<Vec<RegulationSummary>> {
        let store = self.open_store()?;
        let regulations = store.list_filtered(
            query.country.as_deref(),
            query.source,
            query.q.as_deref(),
        )?;
        Ok(regulations.iter().map(RegulationSummary::from).collect())
    }

    /// Full latest version of one regulation.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier is unknown.
    pub fn get_regulation(&self, id: &RegulationId) -> EngineResult<Regulation> {
        let store = self.open_store()?;
        store.get(id)
    }

    /// Requirement records for the latest version of one regulation.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the identifier is unknown.
    pub fn requirements_for(&self, id: &RegulationId) -> EngineResult<Vec<RequirementRecord>> {
        let store = self.open_store()?;
        let version = store.latest_version(id)?;
        store.requirements_for_version(id, version)
    }

    /// Run extraction against the latest version of one regulation.
    /// Idempotent per version; at most one run per `(regulation, version)` is
    /// admitted at a time.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] for an unknown regulation,
    /// [`EngineError::Busy`] when a run for the same version is in flight,
    /// and [`EngineError::ExtractionFailed`] when the text is unprocessable.
    pub fn extract(&self, id: &RegulationId) -> EngineResult<ExtractResult> {
        let mut store = self.open_store()?;
        let regulation = store.get(id)?;

        let key = format!("{}@v{}", regulation.id, regulation.version);
        let _permit = self.extraction_guard.acquire(key)?;

        let records =
            extract_requirements(&regulation, &SentenceSegmenter, OffsetDateTime::now_utc())?;
        let status = store.store_extraction(&regulation, &records)?;

        // the unchanged path reports the stored set, which is content-equal
        // but carries the original extraction timestamps
        let records = if status == ExtractionStatus::Unchanged {
            store.requirements_for_version(&regulation.id, regulation.version)?
        } else {
            records
        };

        Ok(ExtractResult {
            regulation_id: regulation.id,
            regulation_version: regulation.version,
            status,
            records,
        })
    }

    /// Compute the artifacts affected by one requirement against the loaded
    /// cross-reference model. Pure read; runs without coordination.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when the requirement is unknown.
    pub fn resolve_impact(&self, id: &RequirementId) -> EngineResult<ImpactAssessment> {
        let store = self.open_store()?;
        let requirement = store.get_requirement(id)?;
        Ok(self.crossref.resolve(&requirement))
    }

    /// Ledger query, ordered by `(timestamp, sequence)` ascending.
    ///
    /// # Errors
    /// Propagates store read failures.
    pub fn history(&self, filter: &HistoryFilter) -> EngineResult<Vec<HistoryEntry>> {
        let store = self.open_store()?;
        store.history(filter)
    }
}
