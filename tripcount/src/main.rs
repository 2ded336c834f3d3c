//! Trip-count analyzer CLI

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tripcount::NiterConfig;
use tripcount::error::report_error;

#[derive(Parser)]
#[command(name = "tripcount", version, about = "Loop trip-count inference over a textual SSA IR")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze every loop of an IR file
    Analyze {
        /// IR file to analyze
        file: PathBuf,
        /// Engine configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Log engine decisions (overridden by RUST_LOG)
        #[arg(short, long)]
        verbose: bool,
    },
    /// Parse an IR file and print it back
    Dump {
        /// IR file to print
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tripcount=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Command::Analyze { verbose: true, .. });
    init_logging(verbose);

    let result = match cli.command {
        Command::Analyze { file, config, json, .. } => analyze_file(&file, config.as_deref(), json),
        Command::Dump { file } => dump_file(&file),
    };

    if let Err(e) = result {
        if !e.is::<Reported>() {
            eprintln!("Error: {e}");
        }
        std::process::exit(1);
    }
}

/// An error already rendered against its source
#[derive(Debug, thiserror::Error)]
#[error("{0} could not be parsed")]
struct Reported(String);

/// Read and parse `path`, rendering parse errors against the source
fn load(path: &Path) -> Result<tripcount::Program, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    let filename = path.display().to_string();
    match tripcount::parse(&source) {
        Ok(program) => Ok(program),
        Err(e) => {
            report_error(&filename, &source, &e)?;
            Err(Box::new(Reported(filename)))
        }
    }
}

fn analyze_file(path: &Path, config: Option<&Path>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config {
        Some(config) => NiterConfig::load(config)?,
        None => NiterConfig::default(),
    };
    let mut program = load(path)?;
    let reports = tripcount::report::analyze_program(&mut program, &config);

    if json {
        println!("{}", tripcount::report::to_json(&reports)?);
    } else {
        for report in &reports {
            print!("{report}");
        }
    }
    Ok(())
}

fn dump_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let program = load(path)?;
    for func in &program.functions {
        print!("{}", func.display(&program.arena));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_is_reported_once() {
        let path = std::env::temp_dir().join(format!("tripcount-bad-{}.ir", std::process::id()));
        std::fs::write(&path, "fn f() {\nentry:\n  goto nowhere\n}\n").expect("temp file");
        let err = load(&path).err().expect("unknown label");
        std::fs::remove_file(&path).ok();
        // Already rendered by ariadne, so `main` prints nothing more
        assert!(err.is::<Reported>());
    }

    #[test]
    fn test_io_error_is_not_reported() {
        let path = std::env::temp_dir().join("tripcount-missing-file.ir");
        let err = load(&path).err().expect("missing file");
        assert!(!err.is::<Reported>());
    }
}
