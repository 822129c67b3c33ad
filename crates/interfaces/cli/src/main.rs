mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use memctl_config::{AppConfig, ENV_FTS};
use memctl_memory::{MemoryStore, MemoryTier, TokenizerPreset};

/// Operational failures exit 1; internal failures exit 2. Successful
/// no-ops (idempotent re-runs) stay 0.
pub(crate) enum CliOutcome {
    Ok,
    Operational(String),
}

#[derive(Debug, Parser)]
#[command(
    name = "memctl",
    version,
    about = "Policy-governed memory substrate for LLM workflows"
)]
struct Cli {
    /// Database path (defaults to .memctl/memory.db).
    #[arg(long, global = true, env = "MEMCTL_DB")]
    db: Option<PathBuf>,

    /// Config file path (defaults to memctl.json next to the database).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON on stdout where the command supports it.
    #[arg(long, global = true)]
    json: bool,

    /// Only errors on stderr.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug-level diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTier {
    Stm,
    Mtm,
    Ltm,
}

impl CliTier {
    fn tier(self) -> MemoryTier {
        match self {
            CliTier::Stm => MemoryTier::Stm,
            CliTier::Mtm => MemoryTier::Mtm,
            CliTier::Ltm => MemoryTier::Ltm,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSyncMode {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliProtocol {
    Json,
    Regex,
    Passive,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database and print its resolved path.
    Init,
    /// Ingest files, directories, or globs.
    Push {
        /// Source paths or glob patterns.
        #[arg(long, required = true, num_args = 1..)]
        source: Vec<String>,
        /// Re-ingest even when the file hash is unchanged.
        #[arg(long)]
        full: bool,
    },
    /// Store one item from stdin (policy-gated).
    Pull {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "note")]
        r#type: String,
        #[arg(long, num_args = 0..)]
        tag: Vec<String>,
        #[arg(long)]
        scope: Option<String>,
        /// Justification recorded in provenance.
        #[arg(long)]
        why: Option<String>,
    },
    /// Full-text recall through the cascade.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, value_enum, env = "MEMCTL_TIER")]
        tier: Option<CliTier>,
        #[arg(long)]
        r#type: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        /// Restrict to one mount id.
        #[arg(long)]
        mount: Option<String>,
        #[arg(long)]
        include_archived: bool,
    },
    /// Show one item with revisions and links.
    Show { id: String },
    /// Store counters.
    Stats,
    /// Deterministic STM merge and tier promotion.
    Consolidate {
        #[arg(long)]
        scope: Option<String>,
    },
    /// Bounded recall-answer loop against an external LLM.
    Loop {
        question: String,
        #[arg(long, value_enum, default_value = "json")]
        protocol: CliProtocol,
        #[arg(long, default_value_t = 3)]
        max_calls: usize,
        /// External LLM command line (first token is the binary).
        #[arg(long)]
        llm: Option<String>,
        /// Write a JSONL trace here.
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Replay a recorded trace instead of invoking an LLM.
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Per-call timeout in seconds.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// Overall deadline in seconds.
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// List mounts, or register a folder.
    Mount {
        path: Option<PathBuf>,
        #[arg(long, num_args = 0..)]
        ignore: Vec<String>,
    },
    /// 3-tier delta sync over one mount or all mounts.
    Sync {
        path: Option<PathBuf>,
        #[arg(long)]
        full: bool,
    },
    /// Structural corpus digest.
    Inspect {
        path: PathBuf,
        #[arg(long, value_enum, default_value = "auto")]
        sync: CliSyncMode,
        /// Token budget for the text block.
        #[arg(long, default_value_t = 400, env = "MEMCTL_BUDGET")]
        budget: usize,
    },
    /// One-shot folder Q&A.
    Ask {
        path: PathBuf,
        question: String,
        #[arg(long)]
        llm: Option<String>,
        #[arg(long, value_enum, default_value = "auto")]
        sync: CliSyncMode,
        #[arg(long, default_value_t = 300)]
        inspect_cap: usize,
        /// Total context budget in tokens (0 = derive from question).
        #[arg(long, default_value_t = 0, env = "MEMCTL_BUDGET")]
        budget: usize,
    },
    /// Line-based memory-backed chat.
    Chat {
        #[arg(long)]
        llm: Option<String>,
        /// Persist answers as STM items.
        #[arg(long)]
        persist: bool,
        /// Scope recall to a folder (mounted on demand).
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long, env = "MEMCTL_SESSION")]
        session: Option<String>,
    },
    /// Stream matching items as JSONL on stdout.
    Export {
        #[arg(long, value_enum, env = "MEMCTL_TIER")]
        tier: Option<CliTier>,
        #[arg(long)]
        r#type: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        include_archived: bool,
    },
    /// Import JSONL from a file or stdin.
    Import {
        file: Option<PathBuf>,
        #[arg(long)]
        preserve_ids: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the store over the MCP tool surface (JSONL stdio).
    Serve {
        /// Containment root for database paths.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Audit log file (defaults to stderr).
        #[arg(long)]
        audit_log: Option<PathBuf>,
        #[arg(long)]
        llm: Option<String>,
    },
    /// Rebuild the FTS index.
    Reindex {
        #[arg(long, env = "MEMCTL_FTS")]
        tokenizer: Option<String>,
    },
}

/// Shared handles every command works from.
pub(crate) struct App {
    pub store: MemoryStore,
    pub config: AppConfig,
    pub json: bool,
}

fn open_app(cli: &Cli) -> Result<App> {
    let db_path = memctl_config::resolve_db_path(cli.db.as_deref());
    let config = match &cli.config {
        Some(path) => AppConfig::load_or_default(path),
        None => AppConfig::detect_for_db(&db_path),
    };
    let tokenizer_name = std::env::var(ENV_FTS)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.store.fts_tokenizer.clone());
    let tokenizer = TokenizerPreset::parse(&tokenizer_name).unwrap_or(TokenizerPreset::Fr);
    let store = MemoryStore::open(&db_path, tokenizer)?;
    Ok(App {
        store,
        config,
        json: cli.json,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(CliOutcome::Ok) => ExitCode::SUCCESS,
        Ok(CliOutcome::Operational(message)) => {
            eprintln!("memctl: {message}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("memctl: internal error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<CliOutcome> {
    match &cli.command {
        Commands::Init => {
            let app = open_app(&cli)?;
            println!("{}", app.store.db_path().display());
            Ok(CliOutcome::Ok)
        }
        Commands::Push { source, full } => {
            let mut app = open_app(&cli)?;
            commands::push(&mut app, source, *full)
        }
        Commands::Pull {
            title,
            r#type,
            tag,
            scope,
            why,
        } => {
            let mut app = open_app(&cli)?;
            commands::pull(&mut app, title, r#type, tag, scope.as_deref(), why.as_deref())
        }
        Commands::Search {
            query,
            limit,
            tier,
            r#type,
            scope,
            mount,
            include_archived,
        } => {
            let mut app = open_app(&cli)?;
            let filters = memctl_memory::SearchFilters {
                tier: tier.map(CliTier::tier),
                item_type: r#type.clone(),
                scope: scope.clone(),
                mount_id: mount.clone(),
                include_archived: *include_archived,
                injectable_only: false,
            };
            commands::search(&mut app, query, &filters, *limit)
        }
        Commands::Show { id } => {
            let app = open_app(&cli)?;
            commands::show(&app, id)
        }
        Commands::Stats => {
            let app = open_app(&cli)?;
            commands::stats(&app)
        }
        Commands::Consolidate { scope } => {
            let mut app = open_app(&cli)?;
            commands::consolidate(&mut app, scope.as_deref())
        }
        Commands::Loop {
            question,
            protocol,
            max_calls,
            llm,
            trace,
            replay,
            timeout,
            deadline,
        } => {
            let mut app = open_app(&cli)?;
            let protocol = match protocol {
                CliProtocol::Json => memctl_runtime::LoopProtocol::Json,
                CliProtocol::Regex => memctl_runtime::LoopProtocol::Regex,
                CliProtocol::Passive => memctl_runtime::LoopProtocol::Passive,
            };
            commands::run_loop_command(
                &mut app,
                question,
                protocol,
                *max_calls,
                llm.as_deref(),
                trace.as_deref(),
                replay.as_deref(),
                *timeout,
                *deadline,
            )
            .await
        }
        Commands::Mount { path, ignore } => {
            let mut app = open_app(&cli)?;
            commands::mount(&mut app, path.as_deref(), ignore)
        }
        Commands::Sync { path, full } => {
            let mut app = open_app(&cli)?;
            commands::sync(&mut app, path.as_deref(), *full)
        }
        Commands::Inspect { path, sync, budget } => {
            let mut app = open_app(&cli)?;
            let sync = sync_mode(*sync);
            commands::inspect(&mut app, path, sync, *budget)
        }
        Commands::Ask {
            path,
            question,
            llm,
            sync,
            inspect_cap,
            budget,
        } => {
            let mut app = open_app(&cli)?;
            commands::ask(
                &mut app,
                path,
                question,
                llm.as_deref(),
                sync_mode(*sync),
                *inspect_cap,
                *budget,
            )
            .await
        }
        Commands::Chat {
            llm,
            persist,
            folder,
            session,
        } => {
            let mut app = open_app(&cli)?;
            commands::chat(
                &mut app,
                llm.as_deref(),
                *persist,
                folder.as_deref(),
                session.as_deref(),
            )
            .await
        }
        Commands::Export {
            tier,
            r#type,
            scope,
            include_archived,
        } => {
            let mut app = open_app(&cli)?;
            let filters = memctl_memory::SearchFilters {
                tier: tier.map(CliTier::tier),
                item_type: r#type.clone(),
                scope: scope.clone(),
                mount_id: None,
                include_archived: *include_archived,
                injectable_only: false,
            };
            commands::export(&mut app, &filters)
        }
        Commands::Import {
            file,
            preserve_ids,
            dry_run,
        } => {
            let mut app = open_app(&cli)?;
            commands::import(&mut app, file.as_deref(), *preserve_ids, *dry_run)
        }
        Commands::Serve {
            root,
            audit_log,
            llm,
        } => {
            let db_path = memctl_config::resolve_db_path(cli.db.as_deref());
            commands::serve(
                &db_path,
                cli.config.as_deref(),
                root.as_deref(),
                audit_log.as_deref(),
                llm.as_deref(),
            )
            .await
        }
        Commands::Reindex { tokenizer } => {
            let mut app = open_app(&cli)?;
            commands::reindex(&mut app, tokenizer.as_deref())
        }
    }
}

fn sync_mode(mode: CliSyncMode) -> memctl_ingest::SyncMode {
    match mode {
        CliSyncMode::Auto => memctl_ingest::SyncMode::Auto,
        CliSyncMode::Always => memctl_ingest::SyncMode::Always,
        CliSyncMode::Never => memctl_ingest::SyncMode::Never,
    }
}
