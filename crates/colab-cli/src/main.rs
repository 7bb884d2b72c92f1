use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colab_config::Config;
use colab_history::{ErrorCategory, HistoryStore, Mode, QueryFilter, Status as HistoryStatus};
use colab_runtime::assignment::AssignRequest;
use colab_runtime::colab_api::CcuInfo;
use colab_runtime::dispatcher::{CancelHandle, ExecuteOptions};
use colab_runtime::{
    calculate_memory_usage, format_memory, ColabApiClient, HttpTransport, RuntimeManager,
    StaticTokenSource, Variant,
};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

const DEFAULT_NOTEBOOK_PATH: &str = "/colab-cli-session.ipynb";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign a runtime (if needed) and execute code against it
    Run {
        /// Python code to execute
        code: String,
        /// Abort the execution after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Accelerator variant to request: default, gpu, tpu
        #[arg(long, default_value = "default")]
        variant: String,
        /// Request a new assignment even if a matching one already exists
        #[arg(long)]
        force_new: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show the current assignment(s) for this account
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Query the execution history log
    History {
        /// Filter by status: ok, error, abort
        #[arg(long)]
        status: Option<String>,
        /// Filter by mode: kernel, terminal
        #[arg(long)]
        mode: Option<String>,
        /// Filter by error category
        #[arg(long)]
        category: Option<String>,
        /// Only entries at or after this RFC3339 timestamp
        #[arg(long)]
        since: Option<String>,
        /// Only entries at or before this RFC3339 timestamp
        #[arg(long)]
        until: Option<String>,
        /// Maximum number of entries to show (0 returns no entries)
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Check or refresh the access token
    Auth {
        /// Force a token refresh
        #[arg(long)]
        force: bool,
        /// Validate the token against getUserInfo
        #[arg(long)]
        validate: bool,
    },
    /// Print aggregate statistics over the execution history
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli.command).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run { code, timeout_ms, variant, force_new, json } => {
            run_code(&code, timeout_ms, &variant, force_new, json).await
        }
        Commands::Status { json } => status(json).await,
        Commands::History { status, mode, category, since, until, limit, json } => {
            history(status, mode, category, since, until, limit, json).await
        }
        Commands::Auth { force, validate } => auth(force, validate).await,
        Commands::Stats { json } => stats(json).await,
    }
}

fn parse_variant(s: &str) -> Result<Variant> {
    match s.to_lowercase().as_str() {
        "default" => Ok(Variant::Default),
        "gpu" => Ok(Variant::Gpu),
        "tpu" => Ok(Variant::Tpu),
        other => bail!("unknown variant '{other}', expected default|gpu|tpu"),
    }
}

fn build_client(config: &Config) -> Result<ColabApiClient> {
    let token_source = Arc::new(StaticTokenSource::from_env().context(
        "no access token available; set COLAB_ACCESS_TOKEN or run `colab auth`",
    )?);
    let transport = HttpTransport::new(token_source)?;
    Ok(ColabApiClient::new(
        transport,
        config.colab_api_domain.clone(),
        config.colab_gapi_domain.clone(),
    ))
}

fn build_manager(config: &Config) -> Result<RuntimeManager> {
    let client = build_client(config)?;
    let history = HistoryStore::new(config.history_path.clone());
    Ok(RuntimeManager::new(client, history))
}

#[derive(Serialize)]
struct RunOutput {
    status: String,
    error_code: i32,
    stdout: String,
    stderr: String,
    traceback: Vec<String>,
    execution_count: Option<i64>,
}

async fn run_code(
    code: &str,
    timeout_ms: Option<u64>,
    variant: &str,
    force_new: bool,
    json: bool,
) -> Result<()> {
    let config = Config::load();
    let manager = build_manager(&config)?;

    let variant = parse_variant(variant)?;
    let assignment = manager
        .assign(&AssignRequest { force_new, variant: Some(variant) })
        .await
        .context("failed to negotiate a runtime assignment")?;

    let session = manager
        .connect(&assignment, DEFAULT_NOTEBOOK_PATH, None)
        .await
        .context("failed to connect to the assigned runtime")?;

    let cancel = CancelHandle::new();
    let ctrl_c_task = if timeout_ms.is_none() {
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("[colab-cli] Ctrl+C received, canceling execution");
                cancel.cancel();
            }
        }))
    } else {
        None
    };

    let opts = ExecuteOptions { timeout_ms, silent: false };
    let result = manager.execute(&session, code, opts, Some(cancel)).await;

    if let Some(task) = ctrl_c_task {
        task.abort();
    }
    manager.disconnect(&assignment.endpoint, "client_shutdown").await;

    let result = result.context("execution failed to start")?;

    if json {
        let output = RunOutput {
            status: format!("{:?}", result.status).to_uppercase(),
            error_code: result.error_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            traceback: result.traceback.clone(),
            execution_count: result.execution_count,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        if !result.stdout.is_empty() {
            print!("{}", result.stdout);
        }
        if !result.stderr.is_empty() {
            eprint!("{}", result.stderr);
        }
        for line in &result.traceback {
            eprintln!("{line}");
        }
    }

    if result.status != HistoryStatus::Ok {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Tabled)]
struct AssignmentRow {
    #[tabled(rename = "LABEL")]
    label: String,
    #[tabled(rename = "ENDPOINT")]
    endpoint: String,
    #[tabled(rename = "ACCELERATOR")]
    accelerator: String,
    #[tabled(rename = "VARIANT")]
    variant: String,
    #[tabled(rename = "TIER")]
    tier: String,
    #[tabled(rename = "IDLE TIMEOUT")]
    idle_timeout: String,
}

fn ram_used_mb(ccu: &CcuInfo) -> Option<u64> {
    match (ccu.ram_total_mb, ccu.ram_usage_fraction) {
        (Some(total), Some(fraction)) => Some(calculate_memory_usage(total, fraction)),
        _ => None,
    }
}

async fn status(json: bool) -> Result<()> {
    let config = Config::load();
    let client = build_client(&config)?;
    let assignments = client
        .list_assignments()
        .await
        .context("failed to list assignments")?;
    let ccu = client.get_ccu_info().await.ok();

    if json {
        #[derive(Serialize)]
        struct StatusOutput<'a> {
            assignments: &'a [colab_runtime::Assignment],
            compute_units_remaining: Option<f64>,
            ram_used_mb: Option<u64>,
            ram_total_mb: Option<u64>,
        }
        let output = StatusOutput {
            assignments: &assignments,
            compute_units_remaining: ccu.as_ref().map(|c| c.compute_units_remaining),
            ram_used_mb: ccu.as_ref().and_then(ram_used_mb),
            ram_total_mb: ccu.as_ref().and_then(|c| c.ram_total_mb),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if let Some(ref c) = ccu {
        print!("Compute units remaining: {:.2}", c.compute_units_remaining);
        if let (Some(total), Some(used)) = (c.ram_total_mb, ram_used_mb(c)) {
            print!(
                "  |  RAM: {} / {}",
                format_memory(used),
                format_memory(total)
            );
        }
        println!();
    }

    if assignments.is_empty() {
        println!("No active assignment.");
        return Ok(());
    }

    let rows: Vec<AssignmentRow> = assignments
        .iter()
        .map(|a| AssignmentRow {
            label: a.label.clone(),
            endpoint: a.endpoint.clone(),
            accelerator: a.accelerator.clone(),
            variant: format!("{:?}", a.variant).to_uppercase(),
            tier: format!("{:?}", a.subscription_tier),
            idle_timeout: a
                .idle_timeout_sec
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "TIME")]
    time: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "MODE")]
    mode: String,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "ERROR CODE")]
    error_code: i32,
}

fn parse_status(s: &str) -> Result<HistoryStatus> {
    match s.to_lowercase().as_str() {
        "ok" => Ok(HistoryStatus::Ok),
        "error" => Ok(HistoryStatus::Error),
        "abort" => Ok(HistoryStatus::Abort),
        other => bail!("unknown status '{other}', expected ok|error|abort"),
    }
}

fn parse_mode(s: &str) -> Result<Mode> {
    match s.to_lowercase().as_str() {
        "kernel" => Ok(Mode::Kernel),
        "terminal" => Ok(Mode::Terminal),
        other => bail!("unknown mode '{other}', expected kernel|terminal"),
    }
}

fn parse_category(s: &str) -> Result<ErrorCategory> {
    match s.to_lowercase().as_str() {
        "syntax" => Ok(ErrorCategory::Syntax),
        "import" => Ok(ErrorCategory::Import),
        "runtime" => Ok(ErrorCategory::Runtime),
        "timeout" => Ok(ErrorCategory::Timeout),
        "transport" => Ok(ErrorCategory::Transport),
        "canceled" => Ok(ErrorCategory::Canceled),
        "other" => Ok(ErrorCategory::Other),
        other => bail!("unknown category '{other}'"),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC3339 timestamp '{s}'"))?
        .with_timezone(&Utc))
}

async fn history(
    status_filter: Option<String>,
    mode: Option<String>,
    category: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let config = Config::load();
    let store = HistoryStore::new(config.history_path.clone());

    let filter = QueryFilter {
        status: status_filter.as_deref().map(parse_status).transpose()?,
        mode: mode.as_deref().map(parse_mode).transpose()?,
        category: category.as_deref().map(parse_category).transpose()?,
        since: since.as_deref().map(parse_timestamp).transpose()?,
        until: until.as_deref().map(parse_timestamp).transpose()?,
        limit,
    };

    let entries = store.query(&filter).await.context("failed to query history")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No history entries found.");
        return Ok(());
    }

    let rows: Vec<HistoryRow> = entries
        .iter()
        .map(|e| HistoryRow {
            time: e.timestamp.to_rfc3339(),
            status: format!("{:?}", e.status).to_uppercase(),
            mode: format!("{:?}", e.mode).to_lowercase(),
            command: truncate(&e.command, 60),
            error_code: e.error_code,
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    let flattened: String = s.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    if flattened.chars().count() <= max {
        flattened
    } else {
        format!("{}...", flattened.chars().take(max).collect::<String>())
    }
}

async fn auth(force: bool, validate: bool) -> Result<()> {
    let token_source = StaticTokenSource::from_env()
        .context("no access token available; set COLAB_ACCESS_TOKEN")?;
    let token = colab_runtime::AccessTokenSource::get(&token_source, force)
        .await
        .context("failed to obtain access token")?;
    println!("Token acquired ({} chars).", token.len());

    if validate {
        let config = Config::load();
        let client = build_client(&config)?;
        let user = client.get_user_info().await.context("getUserInfo failed")?;
        println!("Authenticated as {}", user.email);
    }
    Ok(())
}

async fn stats(json: bool) -> Result<()> {
    let config = Config::load();
    let store = HistoryStore::new(config.history_path.clone());
    let stats = store.get_stats().await.context("failed to compute stats")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Execution Stats");
    println!("===============");
    println!("Total:      {}", stats.total_executions);
    println!("Successful: {}", stats.successful_executions);
    println!("Failed:     {}", stats.failed_executions);
    println!("Aborted:    {}", stats.aborted_executions);
    println!("Success rate: {}%", stats.success_rate);
    if let Some(oldest) = stats.oldest_entry {
        println!("Oldest entry: {}", oldest.to_rfc3339());
    }
    if let Some(newest) = stats.newest_entry {
        println!("Newest entry: {}", newest.to_rfc3339());
    }
    Ok(())
}
