mod config;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use runtime::Runner;
use storage::{Event, MemoryBank, MemoryRecord, SessionKey, SessionStore};
use telemetry::Telemetry;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "conductor.toml";
const DEFAULT_APP: &str = "profiler";
const DEFAULT_USER: &str = "local";

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Run hierarchical agent pipelines with durable memory", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; built-in defaults are used when it does not exist
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured pipeline once
    Run(RunArgs),
    /// Inspect or edit the memory file
    Memory {
        /// Whose memories to operate on
        #[arg(short, long, global = true, default_value = DEFAULT_USER)]
        user: String,

        #[command(subcommand)]
        command: MemoryCommand,
    },
}

#[derive(Args)]
struct RunArgs {
    /// The request for the root agent
    #[arg(short, long)]
    message: String,
    #[arg(long, default_value = DEFAULT_APP)]
    app: String,
    #[arg(short, long, default_value = DEFAULT_USER)]
    user: String,
    /// Session to continue; a new one is generated when omitted
    #[arg(short, long)]
    session: Option<String>,
    /// Write the trace and metrics snapshot to this file instead of stdout
    #[arg(long)]
    telemetry_out: Option<PathBuf>,
    /// Also print events from non-root agents
    #[arg(long)]
    show_suppressed: bool,
    /// Neither read nor write the memory file
    #[arg(long)]
    no_memory: bool,
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Store a record
    Add {
        /// Record type, e.g. "exam_analysis"
        #[arg(short = 't', long = "type")]
        kind: String,
        /// Record content as JSON
        #[arg(long)]
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List records, newest first
    Query {
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Rank records by relevance to a term
    Search {
        term: String,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Print the digest that would be threaded into the next run
    Compact {
        /// Token budget; defaults to the configured one
        #[arg(short, long)]
        budget: Option<usize>,
        /// Tags that make a record more relevant
        #[arg(long = "focus")]
        focus: Vec<String>,
        /// Only consider records of these types
        #[arg(short = 't', long = "type")]
        kinds: Vec<String>,
    },
    /// Count records by type
    Summary,
    /// Report rows that no longer decode
    Verify,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;
    telemetry::logging::init(config.logging.format, &config.logging.level)?;
    tracing::debug!(path = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Run(args) => cmd_run(&config, args).await,
        Commands::Memory { user, command } => cmd_memory(&config, &user, command),
    }
}

async fn cmd_run(config: &Config, args: RunArgs) -> Result<()> {
    let client = config.client()?;
    let agent = config.agent(&client)?;
    let telemetry = Arc::new(Telemetry::new());
    let sessions = Arc::new(SessionStore::new());

    let mut runner = Runner::new(&args.app, agent, sessions, Arc::clone(&telemetry))?
        .include_suppressed(args.show_suppressed);
    if !args.no_memory {
        let bank = open_bank(config)?;
        runner = runner.with_memory(Arc::new(bank), config.memory.token_budget);
        if !config.memory.focus_tags.is_empty() {
            runner = runner.memory_focus(config.memory.focus_tags.clone());
        }
    }

    let session = args
        .session
        .unwrap_or_else(|| SessionKey::generate(&args.app, &args.user).session);
    println!("Session: {session}");
    println!("Provider: {}\n", client.name());

    let mut events = runner.run(&args.user, &session, args.message)?;
    let mut failure = None;
    while let Some(event) = events.next().await {
        print_event(&event);
        if event.terminal {
            failure = event.error.clone();
        }
    }

    let snapshot = serde_json::to_string_pretty(&telemetry.snapshot())?;
    match &args.telemetry_out {
        Some(path) => {
            std::fs::write(path, snapshot)?;
            println!("\nTelemetry written to {}", path.display());
        }
        None => println!("\n{snapshot}"),
    }

    match failure {
        Some(message) => Err(Error::RunFailed { session, message }),
        None => Ok(()),
    }
}

fn cmd_memory(config: &Config, user: &str, command: MemoryCommand) -> Result<()> {
    let bank = open_bank(config)?;

    match command {
        MemoryCommand::Add {
            kind,
            content,
            tags,
        } => {
            let content = serde_json::from_str(&content).map_err(Error::InvalidContent)?;
            let id = bank.add(user, &kind, content, &tags)?;
            println!("{id}");
        }
        MemoryCommand::Query { kind, tag, limit } => {
            print_records(&bank.query(user, kind.as_deref(), tag.as_deref(), limit)?)?;
        }
        MemoryCommand::Search { term, limit } => {
            print_records(&bank.search(user, &term, limit)?)?;
        }
        MemoryCommand::Compact {
            budget,
            focus,
            kinds,
        } => {
            let budget = budget.unwrap_or(config.memory.token_budget);
            let digest = bank.compact_for(user, budget, &focus, &kinds)?;
            if digest.is_empty() {
                println!("Nothing fits in {budget} tokens.");
            } else {
                println!("{}", digest.text);
                println!("\n({} records, ~{} tokens)", digest.records.len(), digest.tokens);
            }
        }
        MemoryCommand::Summary => {
            println!("{}", serde_json::to_string_pretty(&bank.summary(user)?)?);
        }
        MemoryCommand::Verify => {
            let problems = bank.verify()?;
            for problem in &problems {
                println!("{problem}");
            }
            if !problems.is_empty() {
                return Err(Error::Corrupted(problems.len()));
            }
            println!("ok");
        }
    }
    Ok(())
}

fn open_bank(config: &Config) -> Result<MemoryBank> {
    let path: &Path = &config.memory.path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(MemoryBank::open(path)?.with_weights(config.memory.weights()))
}

fn print_records(records: &[MemoryRecord]) -> Result<()> {
    if records.is_empty() {
        println!("No records found.");
    }
    for record in records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    if let Some(message) = &event.error {
        println!("[{time}] ERROR {}: {message}", event.author);
        return;
    }

    let body = match event.data() {
        Some(value) if event.terminal => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        Some(value) => truncate(&value.to_string(), 200),
        None => truncate(&event.text(), 200),
    };
    let marker = if event.visible { "" } else { " (suppressed)" };
    println!("[{time}] {}{marker}: {body}", event.author);
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_run_command() {
        let cli = Cli::parse_from([
            "conductor",
            "run",
            "-m",
            "Analyze sample.pdf",
            "--session",
            "s1",
            "--telemetry-out",
            "out.json",
        ]);
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.message, "Analyze sample.pdf");
        assert_eq!(args.app, DEFAULT_APP);
        assert_eq!(args.session.as_deref(), Some("s1"));
        assert_eq!(args.telemetry_out, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn parse_memory_command() {
        let cli = Cli::parse_from([
            "conductor",
            "memory",
            "--user",
            "alice",
            "add",
            "--type",
            "exam_analysis",
            "--content",
            r#"{"topic": "Optics"}"#,
            "--tag",
            "physics",
            "--tag",
            "2024",
        ]);
        let Commands::Memory { user, command } = cli.command else {
            panic!("expected memory");
        };
        assert_eq!(user, "alice");
        let MemoryCommand::Add { kind, tags, .. } = command else {
            panic!("expected add");
        };
        assert_eq!(kind, "exam_analysis");
        assert_eq!(tags, vec!["physics", "2024"]);
    }

    #[test]
    fn parse_memory_limits_and_types() {
        let cli = Cli::parse_from(["conductor", "memory", "search", "optics", "--limit", "3"]);
        let Commands::Memory { command, .. } = cli.command else {
            panic!("expected memory");
        };
        let MemoryCommand::Search { term, limit } = command else {
            panic!("expected search");
        };
        assert_eq!(term, "optics");
        assert_eq!(limit, Some(3));

        let cli = Cli::parse_from([
            "conductor",
            "memory",
            "compact",
            "--type",
            "exam_analysis",
            "-t",
            "recommendation",
            "--focus",
            "physics",
        ]);
        let Commands::Memory { command, .. } = cli.command else {
            panic!("expected memory");
        };
        let MemoryCommand::Compact { budget, focus, kinds } = command else {
            panic!("expected compact");
        };
        assert_eq!(budget, None);
        assert_eq!(focus, vec!["physics"]);
        assert_eq!(kinds, vec!["exam_analysis", "recommendation"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }

    #[tokio::test]
    async fn mock_pipeline_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::parse("[backend]\nprovider = \"mock\"").unwrap();
        config.memory.path = dir.path().join("memory.db");

        let args = RunArgs {
            message: "Analyze sample.pdf".into(),
            app: DEFAULT_APP.into(),
            user: DEFAULT_USER.into(),
            session: Some("s1".into()),
            telemetry_out: Some(dir.path().join("telemetry.json")),
            show_suppressed: false,
            no_memory: false,
        };
        cmd_run(&config, args).await.unwrap();

        let snapshot: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("telemetry.json")).unwrap())
                .unwrap();
        assert_eq!(snapshot["metrics"]["counters"]["runs.total"], 1);
        assert_eq!(snapshot["traces"][0]["status"], "complete");

        let bank = open_bank(&config).unwrap();
        assert_eq!(bank.summary(DEFAULT_USER).unwrap().total, 1);
    }
}
