//! SPP - Symbolic Prompt Program runner
//!
//! The `spp` command loads a program from JSON, evaluates it over a batch of
//! input rows and prints the resulting table.
//!
//! ## Commands
//!
//! - `run`: Evaluate a program over input rows
//! - `validate`: Check a program without calling any backend
//! - `render`: Print a saved result table
//! - `cache`: Inspect or maintain a response cache file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use spp_core::{
    CachedBackend, EchoBackend, Evaluator, FileCache, LlmBackend, OfflineBackend, Program,
    ResponseCache, Row, SppConfig, Table, METRICS,
};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "spp.toml";

#[derive(Parser)]
#[command(name = "spp")]
#[command(author = "SPP Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run symbolic prompt programs over tables of inputs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a program over input rows and print the result table
    Run {
        /// Program file (JSON)
        #[arg(short, long)]
        program: PathBuf,

        /// Input rows: a JSON array of objects, or one object per line
        #[arg(short, long)]
        inputs: PathBuf,

        /// Backend answering generation requests
        #[arg(long, value_enum, default_value_t = BackendKind::Echo)]
        backend: BackendKind,

        /// Response cache file (overrides `cache_path` from config)
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Configuration file (default: ./spp.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum backend requests in flight
        #[arg(long)]
        concurrency: Option<usize>,

        /// Write the result table as JSON to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check that a program parses and is well formed
    Validate {
        /// Program file (JSON)
        #[arg(short, long)]
        program: PathBuf,
    },

    /// Print a result table saved with `run --output`
    Render {
        /// Table file (JSON)
        #[arg(short, long)]
        table: PathBuf,

        /// Maximum characters per cell
        #[arg(short, long, default_value = "40")]
        width: usize,
    },

    /// Inspect or maintain a response cache file
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry and record counts
    Stats {
        #[arg(long)]
        path: PathBuf,
    },
    /// Rewrite the file with one record per key
    Compact {
        #[arg(long)]
        path: PathBuf,
    },
    /// Remove every cached response
    Clear {
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Reply with the rendered prompt
    Echo,
    /// Serve from the cache only; misses fail
    Offline,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Run { config, .. } => config.clone(),
        _ => None,
    };
    let config = load_config(config_path.as_deref())?;

    // Setup logging
    spp_core::init_from_config(&config, cli.verbose, cli.json).context("Invalid log level")?;

    match cli.command {
        Commands::Run {
            program,
            inputs,
            backend,
            cache,
            config: _,
            concurrency,
            output,
        } => {
            cmd_run(
                config,
                &program,
                &inputs,
                backend,
                cache,
                concurrency,
                output.as_deref(),
            )
            .await
        }
        Commands::Validate { program } => cmd_validate(&program),
        Commands::Render { table, width } => cmd_render(&table, width),
        Commands::Cache { action } => match action {
            CacheAction::Stats { path } => cmd_cache_stats(&path).await,
            CacheAction::Compact { path } => cmd_cache_compact(&path),
            CacheAction::Clear { path } => cmd_cache_clear(&path).await,
        },
    }
}

/// Explicit config file, else `./spp.toml` if present, else defaults; then
/// the environment on top.
fn load_config(path: Option<&Path>) -> Result<SppConfig> {
    let base = match path {
        Some(path) => SppConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            SppConfig::load(DEFAULT_CONFIG).context("Failed to load ./spp.toml")?
        }
        None => SppConfig::default(),
    };
    base.apply_env().context("Invalid environment configuration")
}

/// Evaluate a program and print its table
async fn cmd_run(
    mut config: SppConfig,
    program_path: &Path,
    inputs_path: &Path,
    backend: BackendKind,
    cache: Option<PathBuf>,
    concurrency: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    if let Some(n) = concurrency {
        config.max_concurrency = n;
    }
    if cache.is_some() {
        config.cache_path = cache;
    }
    config.validate().context("Invalid configuration")?;

    let program = Program::from_path(program_path)
        .with_context(|| format!("Failed to load program {}", program_path.display()))?;
    let source = std::fs::read_to_string(inputs_path)
        .with_context(|| format!("Failed to read inputs {}", inputs_path.display()))?;
    let rows = parse_rows(&source)
        .with_context(|| format!("Failed to parse inputs {}", inputs_path.display()))?;

    let live: Arc<dyn LlmBackend> = match backend {
        BackendKind::Echo => Arc::new(EchoBackend),
        BackendKind::Offline => {
            if config.cache_path.is_none() {
                bail!("--backend offline needs a response cache (--cache or cache_path)");
            }
            Arc::new(OfflineBackend)
        }
    };
    let backend: Arc<dyn LlmBackend> = match &config.cache_path {
        Some(path) => {
            let cache = FileCache::open(path)
                .with_context(|| format!("Failed to open cache {}", path.display()))?;
            info!(path = %path.display(), "using response cache");
            Arc::new(CachedBackend::new(live, Arc::new(cache)))
        }
        None => live,
    };

    let evaluator = Evaluator::new(backend, config.eval_config());
    let table = program
        .run(&evaluator, rows)
        .await
        .with_context(|| format!("Program '{}' failed", program.name))?;
    METRICS.flush();

    print!("{table}");
    let failed = table.failed_rows();
    if !failed.is_empty() {
        warn!(rows = ?failed, "some rows failed");
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&table)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write table to {}", path.display()))?;
        info!(path = %path.display(), rows = table.len(), "table written");
    }

    Ok(())
}

/// Validate a program file
fn cmd_validate(path: &Path) -> Result<()> {
    let program = Program::from_path(path)
        .with_context(|| format!("Failed to load program {}", path.display()))?;
    program.validate().context("Program is invalid")?;

    println!(
        "✓ {} is valid ({} generation node(s))",
        program.name,
        program.output.gen_nodes()
    );
    Ok(())
}

/// Render a saved table
fn cmd_render(path: &Path, width: usize) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read table {}", path.display()))?;
    let table: Table = serde_json::from_str(&json).context("Not a result table")?;
    print!("{}", table.render_text(width));
    Ok(())
}

async fn cmd_cache_stats(path: &Path) -> Result<()> {
    let cache = open_cache(path)?;
    let stats = cache.stats().await?;

    println!("Cache: {}", path.display());
    println!("Entries: {}", stats.entries);
    println!("Records: {}", stats.records);
    if stats.records > stats.entries {
        println!(
            "\n{} superseded record(s); `spp cache compact` reclaims them",
            stats.records - stats.entries
        );
    }
    Ok(())
}

fn cmd_cache_compact(path: &Path) -> Result<()> {
    let cache = open_cache(path)?;
    let dropped = cache.compact().context("Failed to compact cache")?;
    println!("✓ Compacted {} ({} record(s) dropped)", path.display(), dropped);
    Ok(())
}

async fn cmd_cache_clear(path: &Path) -> Result<()> {
    let cache = open_cache(path)?;
    cache.clear().await.context("Failed to clear cache")?;
    println!("✓ Cleared {}", path.display());
    Ok(())
}

fn open_cache(path: &Path) -> Result<FileCache> {
    FileCache::open(path).with_context(|| format!("Failed to open cache {}", path.display()))
}

/// Accepts a JSON array of objects or JSON Lines with one object per line.
fn parse_rows(source: &str) -> Result<Vec<Row>> {
    let trimmed = source.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("Expected a JSON array of objects");
    }

    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Line {}: expected a JSON object", i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rows_json_array() {
        let rows = parse_rows(r#" [{"city": "Paris"}, {"city": "Rome", "n": 2}] "#).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_parse_rows_json_lines() {
        let rows = parse_rows("{\"q\": \"a\"}\n\n{\"q\": \"b\"}\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("q"), Some(&json!("a")));
    }

    #[test]
    fn test_parse_rows_rejects_scalars() {
        let err = parse_rows("{\"q\": 1}\n42\n").unwrap_err();
        assert!(format!("{err:#}").contains("Line 2"));
    }

    #[test]
    fn test_parse_rows_empty_input() {
        assert!(parse_rows("").unwrap().is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spp.toml");
        std::fs::write(&path, "model = \"local-model\"\nmax_concurrency = 3\n").unwrap();
        let config = SppConfig::load(&path).unwrap();
        assert_eq!(config.model, "local-model");
        assert_eq!(config.eval_config().max_concurrency, 3);
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "spp",
            "--verbose",
            "run",
            "--program",
            "p.json",
            "--inputs",
            "rows.jsonl",
            "--backend",
            "offline",
            "--cache",
            ".spp/cache.jsonl",
            "--concurrency",
            "4",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                backend,
                concurrency,
                cache,
                ..
            } => {
                assert_eq!(backend, BackendKind::Offline);
                assert_eq!(concurrency, Some(4));
                assert_eq!(cache, Some(PathBuf::from(".spp/cache.jsonl")));
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_cache_commands_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");
        cmd_cache_stats(&path).await.unwrap();
        cmd_cache_compact(&path).unwrap();
        cmd_cache_clear(&path).await.unwrap();
        assert_eq!(open_cache(&path).unwrap().stats().await.unwrap().entries, 0);
    }
}
