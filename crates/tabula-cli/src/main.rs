use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tabula_core::{Config, QueryResponse, Result, Tabula, Value, VersionStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(about = "Tabula: versioned datasets with natural-language queries")]
struct Cli {
    #[arg(long, default_value = "./data")]
    path: PathBuf,

    /// Tenant every command operates under.
    #[arg(long, default_value = "default")]
    tenant: String,

    #[arg(long)]
    workers: Option<usize>,

    /// Path to a GGUF model (requires the `llm` feature).
    #[arg(long)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a CSV file as a new dataset version.
    Ingest {
        dataset: String,
        file: PathBuf,
        /// Block until the version is Ready or Failed.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Show the status of one dataset version.
    Status { dataset: String, version: u64 },
    /// Ask a natural-language question against a dataset.
    Ask {
        dataset: String,
        question: String,
        #[arg(long)]
        version: Option<u64>,
    },
    /// List the tenant's datasets and their current versions.
    Datasets,
    /// Show the query log for a dataset.
    History { dataset: String },
    /// Interactive question shell for one dataset.
    Shell { dataset: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::default();
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    config.llm_model_path = cli.model.clone();

    let engine = Tabula::open(&cli.path, config)?;
    let tenant = cli.tenant.as_str();

    match cli.cmd {
        Command::Ingest {
            dataset,
            file,
            wait,
        } => {
            let payload = std::fs::read(&file)?;
            let receipt = engine.submit_ingestion(tenant, Some(&dataset), &payload)?;
            println!(
                "submitted {} v{} (job {})",
                receipt.dataset_id, receipt.version, receipt.job_id
            );
            if wait {
                let info = engine.wait_for_terminal(
                    tenant,
                    &receipt.dataset_id,
                    receipt.version,
                    Duration::from_secs(300),
                )?;
                match info.status {
                    VersionStatus::Ready => {
                        println!("ready: {} rows", info.row_count.unwrap_or(0))
                    }
                    _ => println!(
                        "failed: {}",
                        info.reason.as_deref().unwrap_or("unknown reason")
                    ),
                }
            }
        }
        Command::Status { dataset, version } => {
            let info = engine.ingestion_status(tenant, &dataset, version)?;
            println!("{dataset} v{version}: {:?}", info.status);
            if let Some(rows) = info.row_count {
                println!("  rows: {rows}");
            }
            if let Some(schema) = &info.schema {
                println!("  columns:\n{}", indent(&schema.describe(), 4));
            }
            if let Some(reason) = &info.reason {
                println!("  reason: {reason}");
            }
            if info.attempts > 0 {
                println!("  attempts: {}", info.attempts);
            }
        }
        Command::Ask {
            dataset,
            question,
            version,
        } => {
            let resp = engine.submit_query(tenant, &dataset, version, &question)?;
            print_response(&resp);
        }
        Command::Datasets => {
            let datasets = engine.list_datasets(tenant);
            if datasets.is_empty() {
                println!("(no datasets)");
            }
            for ds in datasets {
                let current = ds
                    .current_version
                    .map(|v| format!("v{v}"))
                    .unwrap_or_else(|| "none".to_string());
                println!(
                    "{}  current: {}  versions: {}",
                    ds.dataset_id,
                    current,
                    ds.versions.len()
                );
            }
        }
        Command::History { dataset } => {
            for q in engine.query_history(tenant, &dataset) {
                let outcome = match q.status {
                    tabula_core::QueryStatus::Answered => {
                        q.answer.unwrap_or_default()
                    }
                    tabula_core::QueryStatus::Failed => {
                        format!("FAILED: {}", q.validation.unwrap_or_default())
                    }
                };
                println!("[v{}] {} -> {}", q.version_used, q.question, outcome);
            }
        }
        Command::Shell { dataset } => run_shell(&engine, tenant, &dataset)?,
    }
    Ok(())
}

fn run_shell(engine: &Tabula, tenant: &str, dataset: &str) -> Result<()> {
    println!("tabula shell, dataset {dataset:?}. Type a question, or .quit to exit.");
    let mut editor = DefaultEditor::new()
        .map_err(|e| tabula_core::TabulaError::Config(format!("readline init failed: {e}")))?;
    loop {
        match editor.readline("? ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == ".quit" || line == ".exit" {
                    break;
                }
                let _ = editor.add_history_entry(line);
                match engine.submit_query(tenant, dataset, None, line) {
                    Ok(resp) => print_response(&resp),
                    Err(err) => eprintln!("error: {err}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn print_response(resp: &QueryResponse) {
    println!("{}", resp.answer);
    println!("  sql: {}", resp.generated_sql);
    println!("  version: v{}", resp.version_used);
    if !resp.preview.rows.is_empty() {
        println!("  {}", resp.preview.columns.join(" | "));
        for row in &resp.preview.rows {
            let line = row.iter().map(Value::render).collect::<Vec<_>>().join(" | ");
            println!("  {line}");
        }
        if resp.preview.truncated {
            println!("  ... {} rows total", resp.preview.total_rows);
        }
    }
}

fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    text.lines()
        .map(|l| format!("{pad}{l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
