use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod command_exec;
mod error;
mod input;


use error::CliError;

const LOG_ENV: &str = "SAFEFS_LOG";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ErrorFormat {
    Text,
    Json,
}

/// Access granted inside the session's project root.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProjectMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Parser)]
#[command(name = "safefs")]
#[command(
    about = "Mediated file edits with allowlists, managed blocks, and automatic backups."
)]
struct Cli {
    /// Policy file (.toml or .json). Defaults to `<config home>/safefs.toml` when present.
    #[arg(long, env = "SAFEFS_POLICY")]
    policy: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ErrorFormat::Text)]
    error_format: ErrorFormat,

    /// Working directory used to resolve relative paths and discover the project root.
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ProjectMode::ReadWrite)]
    project_mode: ProjectMode,

    /// Append one JSON audit record per operation to this file.
    #[arg(long)]
    audit_log: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show how the path policy treats a path.
    Check { path: PathBuf },
    Read {
        path: PathBuf,
        #[arg(long)]
        max_bytes: Option<u64>,
    },
    /// Replace the whole file with the content of `content_file` (`-` for stdin).
    Write {
        path: PathBuf,
        content_file: PathBuf,
        #[arg(long, default_value_t = false)]
        confirmed: bool,
    },
    /// Apply a unified diff (`-` for stdin).
    Patch {
        path: PathBuf,
        patch_file: PathBuf,
        #[arg(long, default_value_t = false)]
        confirmed: bool,
        /// Allow the diff to touch lines outside managed blocks.
        #[arg(long, default_value_t = false)]
        override_scope: bool,
    },
    /// Print the preview a patch would produce without writing anything.
    Propose { path: PathBuf, patch_file: PathBuf },
    UpsertBlock {
        path: PathBuf,
        #[arg(long)]
        name: String,
        body_file: PathBuf,
        #[arg(long, default_value_t = false)]
        confirmed: bool,
    },
    Blocks { path: PathBuf },
    Backups { path: PathBuf },
    /// Restore a backup by file name, as listed by `backups`.
    Restore {
        path: PathBuf,
        backup: String,
        #[arg(long, default_value_t = false)]
        confirmed: bool,
    },
    /// Apply the retention policy to the backups of a path now.
    Thin { path: PathBuf },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let error_format = cli.error_format;
    match command_exec::run(&cli) {
        Ok(status) => std::process::exit(status.exit_code()),
        Err(err) => {
            match error_format {
                ErrorFormat::Text => eprintln!("{err}"),
                ErrorFormat::Json => eprintln!("{}", error::render_json(&err)),
            }
            std::process::exit(1);
        }
    }
}

fn serialize_json(value: &serde_json::Value, pretty: bool) -> Result<String, CliError> {
    if pretty {
        Ok(serde_json::to_string_pretty(value)?)
    } else {
        Ok(serde_json::to_string(value)?)
    }
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{text}")
        .and_then(|()| stdout.flush())
        .map_err(|err| CliError::Tool(safefs::Error::Io(err)))
}
