//! Runbookd - validate and execute markdown runbooks.
//!
//! Thin command-line front end over the runbook service. The CLI
//! synthesizes a local token context and breadcrumb; authenticating real
//! callers is the job of the HTTP transport that embeds the same service.

use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runbookd::core::{Breadcrumb, RunbookConfig, TokenContext};
use runbookd::service::RunbookService;

/// Validate and execute markdown runbooks
#[derive(Parser)]
#[command(name = "runbookd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Directory containing runbooks (overrides config and RUNBOOKS_DIR)
    #[arg(long, global = true)]
    runbooks_dir: Option<String>,

    /// Subject to act as
    #[arg(long, global = true, default_value = "local")]
    user: String,

    /// Claim held by the caller (name=value, repeatable)
    #[arg(long, global = true)]
    claim: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available runbooks
    List,

    /// Print a runbook's raw content
    Get {
        /// Runbook filename
        filename: String,
    },

    /// Show the environment variables a runbook declares
    RequiredEnv {
        /// Runbook filename
        filename: String,

        /// Environment variable the caller would supply (KEY=VALUE, repeatable)
        #[arg(short, long)]
        env: Vec<String>,
    },

    /// Validate a runbook without executing it
    Validate {
        /// Runbook filename
        filename: String,

        /// Environment variable to validate against (KEY=VALUE, repeatable)
        #[arg(short, long)]
        env: Vec<String>,
    },

    /// Execute a runbook
    Execute {
        /// Runbook filename
        filename: String,

        /// Environment variable for the script (KEY=VALUE, repeatable)
        #[arg(short, long)]
        env: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = RunbookConfig::load()?;
    if let Some(dir) = cli.runbooks_dir {
        config = config.with_runbooks_dir(dir);
    }
    let service = RunbookService::new(config);

    let token = build_token(&cli.user, &cli.claim)?;
    let breadcrumb = Breadcrumb::for_token(&token)
        .with_recursion_stack(Breadcrumb::parse_recursion_stack(
            std::env::var("RUNBOOK_RECURSION_STACK").ok().as_deref(),
        ));

    match cli.command {
        Commands::List => {
            for name in service.list(&token)? {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Get { filename } => {
            print!("{}", service.get(&filename, &token)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::RequiredEnv { filename, env } => {
            let env = parse_env_pairs(&env)?;
            let report = service.required_env(&filename, &token, Some(&env))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { filename, env } => {
            let env = parse_env_pairs(&env)?;
            let record = service.validate(&filename, &token, &breadcrumb, &env)?;
            for error in &record.errors {
                eprintln!("ERROR: {error}");
            }
            for warning in &record.warnings {
                eprintln!("WARNING: {warning}");
            }
            if record.success() {
                println!("Runbook validation passed: {filename}");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Execute { filename, env } => {
            let env = parse_env_pairs(&env)?;
            let record = service.execute(&filename, &token, &breadcrumb, &env, None)?;
            print!("{}", record.stdout);
            eprint!("{}", record.stderr);
            Ok(ExitCode::from(record.return_code.clamp(0, 255) as u8))
        }
    }
}

/// Build the local token context from CLI flags.
fn build_token(user: &str, claims: &[String]) -> Result<TokenContext> {
    let mut token = TokenContext::new(user);
    for pair in claims {
        let (name, values) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("claim must be name=value: {pair}"))?;
        let values: Vec<&str> =
            values.split(',').map(str::trim).filter(|v| !v.is_empty()).collect();
        token = token.with_claim(name, &values);
    }
    Ok(token)
}

/// Parse repeated KEY=VALUE flags into an environment map.
fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("environment variable must be KEY=VALUE: {pair}"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}
