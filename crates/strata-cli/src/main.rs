mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Context, EXIT_FAILURE, EXIT_RECIPE_ERROR, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::install_signal_handler;

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Incremental, cache-aware builder for layered container images"
)]
struct Cli {
    /// Configuration file (default: ./strata.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for cache records, imports and the build lock.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Directory holding layer snapshots.
    #[arg(long, global = true)]
    rootfs_dir: Option<PathBuf>,

    /// Image layout receiving manifests and layers.
    #[arg(long, global = true)]
    oci_dir: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the layers defined by one or more recipe files.
    Build {
        /// Recipe files, built in dependency order.
        #[arg(default_value = "recipe.toml")]
        files: Vec<PathBuf>,
        /// Ignore and drop all cached state before building.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Layer packaging: tar or squashfs.
        #[arg(long)]
        layer_type: Option<String>,
        /// Command runner: host or chroot.
        #[arg(long)]
        runner: Option<String>,
        /// Treat modification-time changes as content changes.
        #[arg(long, default_value_t = false)]
        consider_timestamps: bool,
        /// What to do when a layer's commands fail: abort or continue.
        #[arg(long, default_value = "abort")]
        on_run_failure: String,
        /// Keep the working bundle of the last rebuilt layer.
        #[arg(long, default_value_t = false)]
        leave_unladen: bool,
        /// Recipe variable, as KEY=VALUE. May be repeated.
        #[arg(long = "substitute", short = 's')]
        substitutions: Vec<String>,
    },
    /// Print the order recipe files would be built in.
    Order {
        #[arg(default_value = "recipe.toml")]
        files: Vec<PathBuf>,
    },
    /// Remove image blobs no reference, snapshot or cache record uses.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Inspect or drop build cache records.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show the image, snapshot and cache state of a layer.
    Inspect {
        layer: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// List cache records.
    List,
    /// Delete every cache record.
    Clear,
    /// Drop the record of one layer so its next build starts fresh.
    Forget { layer: String },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let result = Context::load(
        cli.config.as_deref(),
        cli.state_dir,
        cli.rootfs_dir,
        cli.oci_dir,
        cli.json,
    )
    .and_then(|ctx| match cli.command {
        Commands::Build {
            files,
            no_cache,
            layer_type,
            runner,
            consider_timestamps,
            on_run_failure,
            leave_unladen,
            substitutions,
        } => commands::build::run(
            ctx,
            &files,
            &commands::build::Flags {
                no_cache,
                layer_type,
                runner,
                consider_timestamps,
                on_run_failure,
                leave_unladen,
                substitutions,
            },
        ),
        Commands::Order { files } => commands::order::run(&ctx, &files),
        Commands::Gc { dry_run } => commands::gc::run(&ctx, dry_run),
        Commands::Cache { action } => match action {
            CacheAction::List => commands::cache::list(&ctx),
            CacheAction::Clear => commands::cache::clear(&ctx),
            CacheAction::Forget { layer } => commands::cache::forget(&ctx, &layer),
        },
        Commands::Inspect { layer } => commands::inspect::run(&ctx, &layer),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("recipe error:")
                || msg.starts_with("configuration error:")
                || msg.starts_with("dependency cycle")
            {
                EXIT_RECIPE_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("state lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
