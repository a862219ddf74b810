use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use context_blocks::{
    AssembledOutput, AssemblyStatus, BlockStore, CancellationToken, EngineConfig,
    InclusionTracker, SessionLock, SessionSnapshot, SkipReason, TaskContext,
    UnsupportedTriggerPolicy,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

const DEFAULT_BLOCKS_DIR: &str = ".agents/blocks";

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "context-blocks")]
#[command(about = "Conditional context assembly for AI agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Engine config (JSON or TOML); default: <blocks>/context-blocks.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded blocks with their triggers
    List(ListArgs),

    /// Load and validate a block directory
    Check(CheckArgs),

    /// Assemble the context for a task
    Resolve(ResolveArgs),

    /// Forget everything a persisted session has seen
    Reset(ResetArgs),
}

#[derive(Args)]
struct BlocksArg {
    /// Directory of block documents
    #[arg(long, default_value = DEFAULT_BLOCKS_DIR)]
    blocks: PathBuf,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    source: BlocksArg,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    source: BlocksArg,
}

#[derive(Args)]
struct ResolveArgs {
    #[command(flatten)]
    source: BlocksArg,

    /// Intent tag (repeatable)
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// File the task concerns
    #[arg(long)]
    path: Option<String>,

    /// Free-text task description
    #[arg(long)]
    description: Option<String>,

    /// Session file shared by consecutive invocations
    #[arg(long)]
    session: Option<PathBuf>,

    /// Fail on unsupported trigger kinds instead of skipping them
    #[arg(long)]
    strict: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ResetArgs {
    /// Session file to clear
    #[arg(long)]
    session: PathBuf,
}

#[derive(Serialize)]
struct BlockSummary<'a> {
    name: &'a str,
    trigger: String,
    delegated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    hook: Option<&'a str>,
    origin: &'a str,
}

#[derive(Serialize)]
struct ResolveReport<'a> {
    document: String,
    #[serde(flatten)]
    output: &'a AssembledOutput,
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();

    // Keep stdout clean for JSON parsing
    let json_output = match &cli.command {
        Commands::List(args) => args.json,
        Commands::Resolve(args) => args.json,
        _ => false,
    };
    if json_output {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::List(args) => run_list(args)?,
        Commands::Check(args) => run_check(args, cli.config.as_deref())?,
        Commands::Resolve(args) => run_resolve(args, cli.config.as_deref()).await?,
        Commands::Reset(args) => run_reset(args).await?,
    }

    Ok(())
}

fn load_store(blocks: &Path) -> Result<BlockStore> {
    BlockStore::load_dir(blocks)
        .with_context(|| format!("Failed to load blocks from {}", blocks.display()))
}

fn load_config(blocks: &Path, explicit: Option<&Path>) -> Result<EngineConfig> {
    let mut config = EngineConfig::discover(blocks, explicit)?;
    config.apply_env()?;
    Ok(config)
}

fn run_list(args: ListArgs) -> Result<()> {
    let store = load_store(&args.source.blocks)?;
    let summaries: Vec<BlockSummary> = store
        .all_blocks()
        .iter()
        .map(|block| BlockSummary {
            name: block.name(),
            trigger: block.trigger().to_string(),
            delegated: block.is_delegated(),
            hook: block.delegate().and_then(|d| d.hook.as_deref()),
            origin: block.origin(),
        })
        .collect();

    if args.json {
        return print_stdout(&serde_json::to_string_pretty(&summaries)?);
    }
    for summary in &summaries {
        let marker = if summary.delegated { " [delegated]" } else { "" };
        print_stdout(&format!("{}{marker}", summary.name))?;
        print_stdout(&format!("   Trigger: {}", summary.trigger))?;
        print_stdout(&format!("   Origin: {}", summary.origin))?;
    }
    Ok(())
}

fn run_check(args: CheckArgs, config: Option<&Path>) -> Result<()> {
    let store = load_store(&args.source.blocks)?;
    let config = load_config(&args.source.blocks, config)?;
    let registry = config.build_registry()?;

    for block in store.all_blocks() {
        if let Some(kind) = block.trigger().unsupported_kind() {
            log::warn!("Block '{}' uses unsupported trigger kind '{kind}'", block.name());
        }
        if block.is_delegated() {
            registry.hook_for(block).with_context(|| {
                format!("Block '{}' ({}) cannot be delegated", block.name(), block.origin())
            })?;
        }
    }

    eprintln!(
        "{} block(s) OK in {}",
        store.len(),
        args.source.blocks.display()
    );
    Ok(())
}

async fn run_resolve(args: ResolveArgs, config: Option<&Path>) -> Result<()> {
    let store = load_store(&args.source.blocks)?;
    let mut config = load_config(&args.source.blocks, config)?;
    if args.strict {
        config.unsupported_triggers = UnsupportedTriggerPolicy::Fail;
    }
    let assembler = config.assembler()?;

    // Held until the snapshot is saved
    let _session_lock = match &args.session {
        Some(path) => Some(SessionLock::acquire(path).await?),
        None => None,
    };
    let tracker = match &args.session {
        Some(path) => InclusionTracker::from_snapshot(SessionSnapshot::load(path)?),
        None => InclusionTracker::new(),
    };

    let mut ctx = TaskContext::new().with_tags(&args.tags);
    if let Some(path) = args.path {
        ctx = ctx.with_file_path(path);
    }
    if let Some(description) = args.description {
        ctx = ctx.with_description(description);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; cancelling resolution");
            on_interrupt.cancel();
        }
    });

    let output = assembler
        .resolve_with_cancel(&ctx, &store, &tracker, &cancel)
        .await?;

    if let Some(path) = &args.session {
        tracker
            .snapshot()
            .save(path)
            .context("Failed to persist session")?;
    }

    let document = output.render(&config.separator);
    if args.json {
        let report = ResolveReport {
            document,
            output: &output,
        };
        return print_stdout(&serde_json::to_string_pretty(&report)?);
    }

    if !document.is_empty() {
        print_stdout(&document)?;
    }
    for failure in &output.errors {
        eprintln!("Error: block '{}': {}", failure.block, failure.error);
    }
    for skipped in &output.skipped {
        match &skipped.reason {
            SkipReason::UnsupportedTrigger { kind } => eprintln!(
                "Skipped: block '{}': unsupported trigger kind '{kind}'",
                skipped.block
            ),
        }
    }
    if output.status == AssemblyStatus::Cancelled {
        eprintln!("Warning: resolution cancelled, output is partial");
    }
    Ok(())
}

async fn run_reset(args: ResetArgs) -> Result<()> {
    let _session_lock = SessionLock::acquire(&args.session).await?;
    SessionSnapshot::default()
        .save(&args.session)
        .context("Failed to reset session")?;
    eprintln!("Session {} cleared", args.session.display());
    Ok(())
}
