//! sandpit CLI - run sandboxed JavaScript locally or through a daemon

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sandpit_core::challenge::{ChallengeCatalog, ValidationReport, Validator};
use sandpit_core::config::default_listen_addr;
use sandpit_core::protocol::{
    ErrorBody, ExecuteRequest, HealthResponse, StatusResponse, ValidateRequest,
};
use sandpit_core::{ConsoleKind, Engine, ExecutionResult, SandboxConfig};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(author, version, about = "Sandboxed JavaScript playground runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code in-process, without a daemon
    Run {
        /// Code to execute (or - for stdin)
        source: String,

        /// Timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,

        /// Hide `fetch` from the script
        #[arg(long)]
        no_network: bool,

        /// Evaluate the source exactly as given
        #[arg(long)]
        no_normalize: bool,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute code via the daemon
    Exec {
        /// Code to execute (or - for stdin)
        source: String,

        /// Daemon address (defaults to SANDPIT_ADDR or 127.0.0.1:7878)
        #[arg(short, long)]
        addr: Option<String>,

        /// Shorten the daemon's deadline, in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Persist entries under this context id
        #[arg(short, long)]
        context: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Validate a solution against a challenge on the daemon
    Validate {
        challenge: String,

        /// Solution source (or - for stdin)
        source: String,

        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Validate a solution against a local challenge catalog
    Check {
        /// JSON challenge catalog
        #[arg(long)]
        catalog: PathBuf,

        challenge: String,

        /// Solution source (or - for stdin)
        source: String,
    },

    /// Get daemon status
    Status {
        #[arg(short, long)]
        addr: Option<String>,
    },

    /// Ping the daemon
    Ping {
        #[arg(short, long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandpit=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            timeout,
            no_network,
            no_normalize,
            json,
        } => {
            let config = SandboxConfig::builder()
                .timeout_ms(timeout)
                .allow_network(!no_network)
                .normalize_source(!no_normalize)
                .build();
            let source = read_source(&source)?;
            let result =
                tokio::task::spawn_blocking(move || Engine::new(config).execute(&source)).await??;
            Ok(report_execution(&result, json))
        }

        Commands::Exec {
            source,
            addr,
            timeout,
            context,
            json,
        } => {
            let client = Client::new(addr);
            let request = ExecuteRequest {
                source: read_source(&source)?,
                context_id: context,
                timeout_ms: timeout,
            };
            let result: ExecutionResult = client.post("/api/execute", &request).await?;
            Ok(report_execution(&result, json))
        }

        Commands::Validate {
            challenge,
            source,
            addr,
        } => {
            let client = Client::new(addr);
            let request = ValidateRequest {
                source: read_source(&source)?,
            };
            let report: ValidationReport = client
                .post(&format!("/api/challenges/{challenge}/validate"), &request)
                .await?;
            Ok(report_validation(&report))
        }

        Commands::Check {
            catalog,
            challenge,
            source,
        } => {
            let source = read_source(&source)?;
            let report = tokio::task::spawn_blocking(move || -> Result<ValidationReport> {
                let catalog = ChallengeCatalog::load(&catalog)?;
                let challenge = catalog.get(&challenge)?;
                let engine = Engine::new(SandboxConfig::default());
                let timeout = engine.config().challenge_timeout;
                Ok(Validator::new(engine, timeout).validate(challenge, &source)?)
            })
            .await??;
            Ok(report_validation(&report))
        }

        Commands::Status { addr } => {
            let status: StatusResponse = Client::new(addr).get("/api/status").await?;
            println!("Isolation:  {}", status.isolation);
            println!(
                "Workers:    {} total, {} idle, {} busy, {} recycling, {} dead",
                status.pool.total,
                status.pool.idle,
                status.pool.busy,
                status.pool.recycling,
                status.pool.dead
            );
            println!("Executions: {} ({} timed out)", status.executions, status.timeouts);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Ping { addr } => {
            let health: HealthResponse = Client::new(addr).get("/health").await?;
            println!("pong ({} {})", health.status, health.version);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_source(arg: &str) -> Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("reading source from stdin")?;
    Ok(source)
}

struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    fn new(addr: Option<String>) -> Self {
        let addr = addr.unwrap_or_else(|| default_listen_addr().to_string());
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr
        } else {
            format!("http://{addr}")
        };
        Self {
            base,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .with_context(|| format!("connecting to daemon at {}", self.base))?;
        decode(response).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await
            .with_context(|| format!("connecting to daemon at {}", self.base))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(err) => bail!("daemon returned {status} ({}): {}", err.code, err.message),
        Err(_) => bail!("daemon returned {status}: {text}"),
    }
}

fn report_execution(result: &ExecutionResult, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(out) => println!("{out}"),
            Err(e) => eprintln!("failed to encode result: {e}"),
        }
    } else {
        for entry in &result.entries {
            match entry.kind {
                ConsoleKind::Log => println!("{}", entry.content),
                ConsoleKind::Info => println!("[info] {}", entry.content),
                ConsoleKind::Warn => eprintln!("[warn] {}", entry.content),
                ConsoleKind::Error => eprintln!("[error] {}", entry.content),
            }
        }
        if !result.return_value.is_null() {
            println!("=> {}", result.return_value);
        }
        if let Some(err) = &result.thrown_error {
            eprintln!("{}: {}", err.kind, err.message);
        }
        eprintln!("({} ms)", result.elapsed_millis);
    }

    if result.thrown_error.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn report_validation(report: &ValidationReport) -> ExitCode {
    for (i, case) in report.results.iter().enumerate() {
        let mark = if case.pass { "PASS" } else { "FAIL" };
        println!("{mark} #{} input={} expected={} actual={}", i + 1, case.input, case.expected, case.actual);
        if let Some(err) = &case.error {
            println!("       error: {err}");
        }
    }
    println!("{}", report.message);

    if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
