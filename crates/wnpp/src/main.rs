use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use wnpp_core::config::load_config;
use wnpp_core::debbugs::{DebbugsClientConfig, SoapDebbugsClient, inspect_issues};
use wnpp_core::feed::{DEFAULT_MAX_ENTRIES, truncate_changelog};
use wnpp_core::import_debbugs::import_debbugs;
use wnpp_core::import_popcon::{ImportPopconOptions, import_popcon};
use wnpp_core::migrate::{pending_migration_count, run_migrations};
use wnpp_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_database_ready,
    init_layout, inspect_runtime, resolve_paths,
};
use wnpp_core::store;

mod server;

#[derive(Debug, Parser)]
#[command(
    name = "wnpp",
    version,
    about = "Debian WNPP dashboard: importers, news feeds and the web listing"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Serve(ServeArgs),
    #[command(name = "import-debbugs")]
    ImportDebbugs,
    #[command(name = "import-popcon")]
    ImportPopcon(ImportPopconArgs),
    #[command(name = "inspect-debbugs")]
    InspectDebbugs(InspectDebbugsArgs),
    #[command(name = "truncate-changelog")]
    TruncateChangelog(TruncateChangelogArgs),
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wnpp/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, value_name = "ADDR", help = "Listen address (default from config)")]
    bind: Option<String>,
}

#[derive(Debug, Args)]
struct ImportPopconArgs {
    #[arg(long, value_name = "HOURS", help = "Re-use downloads younger than this")]
    maximum_stale_hours: Option<u64>,
    #[arg(long, value_name = "PATH", help = "Where downloaded popcon files are kept")]
    download_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InspectDebbugsArgs {
    #[arg(value_name = "ISSUE", required = true)]
    issues: Vec<i64>,
}

#[derive(Debug, Args)]
struct TruncateChangelogArgs {
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_MAX_ENTRIES)]
    spare: usize,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Serve(args)) => run_serve(&runtime, args),
        Some(Commands::ImportDebbugs) => run_import_debbugs(&runtime),
        Some(Commands::ImportPopcon(args)) => run_import_popcon(&runtime, args),
        Some(Commands::InspectDebbugs(args)) => run_inspect_debbugs(&runtime, args),
        Some(Commands::TruncateChangelog(args)) => run_truncate_changelog(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("WNPP_LOG_JSON").is_ok_and(|value| value == "1");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized wnpp runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("cache_dir: {}", normalize_path(&paths.cache_dir));
    println!("static_dir: {}", normalize_path(&paths.static_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_serve(runtime: &RuntimeOptions, args: ServeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    let bind = args.bind.unwrap_or_else(|| config.bind());
    let settings = server::ServerSettings {
        db_path: paths.db_path.clone(),
        static_dir: config.static_dir(&paths.project_root, &paths.static_dir),
        listing: config.listing_settings()?,
    };

    init_tracing();
    for warning in &status.warnings {
        tracing::warn!("{warning}");
    }
    if runtime.diagnostics {
        println!("[diagnostics]\n{}", paths.diagnostics());
    }
    println!("serve");
    println!("bind: {bind}");
    println!("static_dir: {}", normalize_path(&settings.static_dir));
    println!("per_page: {}", settings.listing.per_page);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(server::serve(server::AppState::new(settings), &bind))
}

fn run_import_debbugs(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    init_tracing();

    let report = import_debbugs(&paths, &config)?;

    println!("import-debbugs");
    println!("remote_open: {}", report.remote_open);
    println!("closed: {}", report.closed);
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("refreshed: {}", report.refreshed);
    println!("kind_changes: {}", report.kind_changes);
    println!("malformed: {}", report.malformed);
    println!("request_count: {}", report.request_count);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_import_popcon(runtime: &RuntimeOptions, args: ImportPopconArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    let config = load_config(&paths.config_path)?;
    init_tracing();

    let download_cache_dir = args
        .download_cache_dir
        .unwrap_or_else(|| paths.cache_dir.clone());
    let mut options = ImportPopconOptions::from_config(&config, &download_cache_dir);
    if let Some(hours) = args.maximum_stale_hours {
        options.maximum_stale = Duration::from_secs(hours.saturating_mul(3600));
    }

    let report = import_popcon(&paths, &config, &options)?;

    println!("import-popcon");
    println!("download_cache_dir: {}", normalize_path(&options.download_cache_dir));
    for category in &report.categories {
        let prefix = category.category.as_str();
        match category.fresh_until {
            Some(fresh_until) => println!("{prefix}.fresh_until: {}", fresh_until.to_rfc3339()),
            None => {
                println!("{prefix}.parsed: {}", category.parsed);
                println!("{prefix}.updated: {}", category.updated);
                println!("{prefix}.added: {}", category.added);
            }
        }
    }
    println!("nothing_to_do: {}", format_flag(report.nothing_to_do()));
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_inspect_debbugs(runtime: &RuntimeOptions, args: InspectDebbugsArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    init_tracing();

    let mut client = SoapDebbugsClient::new(DebbugsClientConfig::from_config(&config))?;
    println!("{}", inspect_issues(&mut client, &args.issues)?);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_truncate_changelog(runtime: &RuntimeOptions, args: TruncateChangelogArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_database_ready(&paths, &status)?;
    init_tracing();

    let deleted = truncate_changelog(&paths, args.spare)?;

    println!("truncate-changelog");
    println!("spare: {}", args.spare);
    println!("deleted: {deleted}");
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    } else {
        for migration in &report.applied {
            println!("applied: v{:03} {}", migration.version, migration.name);
        }
    }
    println!("current_version: {}", report.current_version);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.db_exists {
        println!("pending_migrations: {}", pending_migration_count(&paths)?);
        let connection = store::open_connection(&paths.db_path)?;
        for count in store::table_counts(&connection)? {
            println!("table.{}: {}", count.table, count.rows);
        }
    }
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
