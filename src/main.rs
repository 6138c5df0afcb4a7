use analytics_gateway::execution::cell_text;
use analytics_gateway::pipeline::{PipelineFailure, PipelineRequest, PipelineResponse};
use analytics_gateway::{Gateway, GatewayConfig};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "analytics-gateway")]
#[command(about = "Ask questions about tabular data in plain English")]
struct Args {
    /// JSON config file (environment variables still override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of .csv / .parquet tables
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Directory of <table>_metadata.json files
    #[arg(short, long)]
    metadata_dir: Option<PathBuf>,

    /// Print the full response as JSON
    #[arg(long)]
    json: bool,

    /// Print only the result rows as CSV
    #[arg(long, conflicts_with = "json")]
    csv: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a natural-language question
    Ask { question: String },
    /// Run a read-only SQL query through validation and execution
    Sql { query: String },
    /// List the tables and columns the gateway knows about
    Tables,
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &args.metadata_dir {
        config.metadata_dir = Some(dir.clone());
    }
    Ok(config)
}

fn print_response(response: &PipelineResponse, args: &Args) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    if args.csv {
        print!("{}", response.to_csv()?);
        return Ok(());
    }
    println!("SQL:\n{}\n", response.sql_shown);
    for fix in &response.fixes_applied {
        println!("fix: {}", fix);
    }
    for warning in &response.warnings {
        println!("warning: {}", warning);
    }
    println!("{}\n", response.answer_text);
    println!("{}", response.columns.join("\t"));
    for row in &response.rows {
        println!("{}", row.iter().map(cell_text).collect::<Vec<_>>().join("\t"));
    }
    if response.truncated {
        println!("(showing the first {} rows)", response.row_count);
    }
    Ok(())
}

fn print_failure(failure: &PipelineFailure, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(failure)?);
    } else {
        eprintln!("{} failed: {}", failure.stage, failure.reason);
        if let Some(sql) = &failure.sql_shown {
            eprintln!("SQL:\n{}", sql);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("Data directory: {}", config.data_dir.display());
    let gateway = Gateway::from_config(config).await?;

    let outcome = match &args.command {
        Command::Ask { question } => {
            let token = CancellationToken::new();
            let on_interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted; cancelling request");
                    on_interrupt.cancel();
                }
            });
            gateway.ask(&PipelineRequest::new(question), &token).await
        }
        Command::Sql { query } => gateway.run_sql(query).await,
        Command::Tables => {
            let snapshot = gateway.snapshot();
            for table in snapshot.tables() {
                let rows = table
                    .row_count_estimate
                    .map(|n| format!(" ({} rows)", n))
                    .unwrap_or_default();
                println!("{}{}", table.table_name, rows);
                for column in &table.columns {
                    println!("  {} {}", column.column_name, column.datatype);
                }
            }
            return Ok(());
        }
    };

    match outcome {
        Ok(response) => print_response(&response, &args),
        Err(failure) => {
            print_failure(&failure, args.json)?;
            std::process::exit(1);
        }
    }
}
