use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use regtrace_api::{
    EngineConfig, ExtractResult, ImportSummary, ImportedRegulation, RegulationQuery,
    RegulationSummary, TraceabilityApi, API_CONTRACT_VERSION,
};
use regtrace_core::{
    EngineError, HistoryEntry, HistoryFilter, ImpactAssessment, Regulation, RegulationId,
    RequirementId, RequirementRecord, SourceSystem,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: TraceabilityApi,
}

/// Structured error body: an error kind from the engine taxonomy plus a
/// human-readable message. Status codes map 1:1 to kinds.
#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    kind: String,
    message: String,
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { kind: "bad_request".to_string(), message: message.into() }
    }

    fn status(&self) -> StatusCode {
        match self.kind.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "upstream_unavailable" => StatusCode::BAD_GATEWAY,
            "extraction_failed" => StatusCode::UNPROCESSABLE_ENTITY,
            "busy" | "conflict" => StatusCode::CONFLICT,
            "bad_request" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        Self { kind: err.kind().as_str().to_string(), message: err.to_string() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct RegulationsParams {
    country: Option<String>,
    source: Option<SourceSystem>,
    q: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsImportParams {
    topic: String,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct EuImportParams {
    celex_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RegulationScopedParams {
    regulation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryParams {
    subject_id: Option<String>,
    since: Option<String>,
    until: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "regtrace-service")]
#[command(about = "HTTP facade for the regulatory traceability engine")]
struct Args {
    #[arg(long, default_value = "./regtrace.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Cross-reference model YAML; the compiled-in table is used when omitted.
    #[arg(long)]
    crossref: Option<PathBuf>,
    #[arg(long, default_value = "https://www.federalregister.gov/api/v1")]
    us_base_url: String,
    #[arg(long, default_value = "https://eur-lex.europa.eu")]
    eu_base_url: String,
    #[arg(long, default_value_t = 12)]
    upstream_timeout_secs: u64,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/regulations", get(list_regulations))
        .route("/regulations/import/us", post(import_us))
        .route("/regulations/import/eu", post(import_eu))
        .route("/regulations/:regulation_id", get(get_regulation))
        .route("/requirements", get(list_requirements))
        .route("/requirements/extract", post(extract_requirements))
        .route("/impact/:requirement_id", get(get_impact))
        .route("/history", get(get_history))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::new(args.db);
    config.crossref_path = args.crossref;
    config.federal_register_base_url = args.us_base_url;
    config.eur_lex_base_url = args.eu_base_url;
    config.upstream_timeout = Duration::from_secs(args.upstream_timeout_secs);

    let api = TraceabilityApi::new(&config)?;
    let state = ServiceState { api };

    tracing::info!(bind = %args.bind, "regtrace service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn list_regulations(
    State(state): State<ServiceState>,
    Query(params): Query<RegulationsParams>,
) -> Result<Json<Vec<RegulationSummary>>, ServiceError> {
    let query = RegulationQuery { country: params.country, source: params.source, q: params.q };
    let summaries = state.api.list_regulations(&query)?;
    Ok(Json(summaries))
}

async fn import_us(
    State(state): State<ServiceState>,
    Query(params): Query<UsImportParams>,
) -> Result<Json<ImportSummary>, ServiceError> {
    let summary = state.api.import_us(&params.topic, params.limit.unwrap_or(5))?;
    Ok(Json(summary))
}

async fn import_eu(
    State(state): State<ServiceState>,
    Query(params): Query<EuImportParams>,
) -> Result<Json<ImportedRegulation>, ServiceError> {
    let imported = state.api.import_eu(&params.celex_id)?;
    Ok(Json(imported))
}

async fn get_regulation(
    State(state): State<ServiceState>,
    Path(regulation_id): Path<String>,
) -> Result<Json<Regulation>, ServiceError> {
    let regulation = state.api.get_regulation(&RegulationId::new(regulation_id))?;
    Ok(Json(regulation))
}

async fn list_requirements(
    State(state): State<ServiceState>,
    Query(params): Query<RegulationScopedParams>,
) -> Result<Json<Vec<RequirementRecord>>, ServiceError> {
    let records = state.api.requirements_for(&RegulationId::new(params.regulation_id))?;
    Ok(Json(records))
}

async fn extract_requirements(
    State(state): State<ServiceState>,
    Query(params): Query<RegulationScopedParams>,
) -> Result<Json<ExtractResult>, ServiceError> {
    let result = state.api.extract(&RegulationId::new(params.regulation_id))?;
    Ok(Json(result))
}

async fn get_impact(
    State(state): State<ServiceState>,
    Path(requirement_id): Path<String>,
) -> Result<Json<ImpactAssessment>, ServiceError> {
    let assessment = state.api.resolve_impact(&RequirementId::new(requirement_id))?;
    Ok(Json(assessment))
}

async fn get_history(
    State(state): State<ServiceState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, ServiceError> {
    let filter = HistoryFilter {
        subject_id: params.subject_id,
        since: parse_instant_param("since", params.since.as_deref())?,
        until: parse_instant_param("until", params.until.as_deref())?,
    };
    let entries = state.api.history(&filter)?;
    Ok(Json(entries))
}

fn parse_instant_param(
    name: &str,
    value: Option<&str>,
) -> Result<Option<OffsetDateTime>, ServiceError> {
    match value {
        None => Ok(None),
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339).map(Some).map_err(|err| {
            ServiceError::bad_request(format!("query parameter `{name}` is not RFC 3339: {err}"))
        }),
    }
}
