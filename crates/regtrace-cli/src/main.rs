use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use regtrace_api::{EngineConfig, RegulationQuery, TraceabilityApi};
use regtrace_core::{
    HistoryFilter, RegulationDraft, RegulationId, RequirementId, SourceSystem,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rt")]
#[command(about = "Regulatory traceability engine CLI")]
struct Cli {
    #[arg(long, default_value = "./regtrace.sqlite3")]
    db: PathBuf,

    /// Cross-reference model YAML; the compiled-in table is used when omitted.
    #[arg(long)]
    crossref: Option<PathBuf>,

    #[arg(long, default_value = "https://www.federalregister.gov/api/v1")]
    us_base_url: String,

    #[arg(long, default_value = "https://eur-lex.europa.eu")]
    eu_base_url: String,

    #[arg(long, default_value_t = 12)]
    upstream_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Regulations {
        #[command(subcommand)]
        command: RegulationsCommand,
    },
    Requirements {
        #[command(subcommand)]
        command: RequirementsCommand,
    },
    Impact {
        #[command(subcommand)]
        command: ImpactCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
}

#[derive(Debug, Subcommand)]
enum RegulationsCommand {
    List(RegulationsListArgs),
    Show(RegulationsShowArgs),
    Ingest(RegulationsIngestArgs),
    ImportUs(ImportUsArgs),
    ImportEu(ImportEuArgs),
}

#[derive(Debug, Args)]
struct RegulationsListArgs {
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    q: Option<String>,
}

#[derive(Debug, Args)]
struct RegulationsShowArgs {
    regulation_id: String,
}

#[derive(Debug, Args)]
struct RegulationsIngestArgs {
    /// A RegulationDraft JSON document.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ImportUsArgs {
    #[arg(long)]
    topic: String,
    #[arg(long, default_value_t = 5)]
    limit: u32,
}

#[derive(Debug, Args)]
struct ImportEuArgs {
    #[arg(long)]
    celex_id: String,
}

#[derive(Debug, Subcommand)]
enum RequirementsCommand {
    Extract(RegulationScopedArgs),
    List(RegulationScopedArgs),
}

#[derive(Debug, Args)]
struct RegulationScopedArgs {
    #[arg(long)]
    regulation_id: String,
}

#[derive(Debug, Subcommand)]
enum ImpactCommand {
    Show(ImpactShowArgs),
}

#[derive(Debug, Args)]
struct ImpactShowArgs {
    requirement_id: String,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List(HistoryListArgs),
}

#[derive(Debug, Args)]
struct HistoryListArgs {
    #[arg(long)]
    subject_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    #[arg(long)]
    since: Option<String>,
    /// RFC 3339 upper bound, inclusive.
    #[arg(long)]
    until: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert(
                "cli_contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(map)
        }
        other => serde_json::json!({
            "cli_contract_version": CLI_CONTRACT_VERSION,
            "data": other,
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::new(cli.db);
    config.crossref_path = cli.crossref;
    config.federal_register_base_url = cli.us_base_url;
    config.eur_lex_base_url = cli.eu_base_url;
    config.upstream_timeout = Duration::from_secs(cli.upstream_timeout_secs);
    let api = TraceabilityApi::new(&config)?;

    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Regulations { command } => run_regulations(command, &api),
        Command::Requirements { command } => run_requirements(&command, &api),
        Command::Impact { command } => run_impact(&command, &api),
        Command::History { command } => run_history(&command, &api),
    }
}

fn run_db(command: &DbCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::to_value(&status)?)
        }
    }
}

fn run_regulations(command: RegulationsCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        RegulationsCommand::List(args) => {
            let source = match args.source.as_deref() {
                Some(raw) => Some(
                    SourceSystem::parse(raw)
                        .with_context(|| format!("unknown source system: {raw}"))?,
                ),
                None => None,
            };
            let summaries = api.list_regulations(&RegulationQuery {
                country: args.country,
                source,
                q: args.q,
            })?;
            emit_json(serde_json::json!({ "regulations": summaries }))
        }
        RegulationsCommand::Show(args) => {
            let regulation = api.get_regulation(&RegulationId::new(args.regulation_id))?;
            emit_json(serde_json::to_value(&regulation)?)
        }
        RegulationsCommand::Ingest(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read draft file {}", args.file.display()))?;
            let draft: RegulationDraft = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse draft file {}", args.file.display()))?;
            let imported = api.ingest_draft(&draft)?;
            emit_json(serde_json::to_value(&imported)?)
        }
        RegulationsCommand::ImportUs(args) => {
            let summary = api.import_us(&args.topic, args.limit)?;
            emit_json(serde_json::to_value(&summary)?)
        }
        RegulationsCommand::ImportEu(args) => {
            let imported = api.import_eu(&args.celex_id)?;
            emit_json(serde_json::to_value(&imported)?)
        }
    }
}

fn run_requirements(command: &RequirementsCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        RequirementsCommand::Extract(args) => {
            let result = api.extract(&RegulationId::new(args.regulation_id.clone()))?;
            emit_json(serde_json::to_value(&result)?)
        }
        RequirementsCommand::List(args) => {
            let records = api.requirements_for(&RegulationId::new(args.regulation_id.clone()))?;
            emit_json(serde_json::json!({ "requirements": records }))
        }
    }
}

fn run_impact(command: &ImpactCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        ImpactCommand::Show(args) => {
            let assessment =
                api.resolve_impact(&RequirementId::new(args.requirement_id.clone()))?;
            emit_json(serde_json::to_value(&assessment)?)
        }
    }
}

fn run_history(command: &HistoryCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        HistoryCommand::List(args) => {
            let filter = HistoryFilter {
                subject_id: args.subject_id.clone(),
                since: parse_instant(args.since.as_deref())?,
                until: parse_instant(args.until.as_deref())?,
            };
            let entries = api.history(&filter)?;
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn parse_instant(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    match value {
        None => Ok(None),
        Some(raw) => Ok(Some(
            OffsetDateTime::parse(raw, &Rfc3339)
                .with_context(|| format!("not an RFC 3339 instant: {raw}"))?,
        )),
    }
}
