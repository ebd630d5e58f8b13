//! # Content Engine CLI (`cms`)
//!
//! The `cms` binary initializes the store, serves the content API and runs
//! maintenance tasks against the same data directory.
//!
//! ## Usage
//!
//! ```bash
//! cms --config ./config/cms.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cms init` | Create the stores, buckets and search indexes |
//! | `cms serve` | Start the content HTTP API |
//! | `cms search <type> "<query>"` | Full-text search within a type |
//! | `cms list <type>` | Page through a type, newest first |
//! | `cms get <Type:id>` | Print one record as JSON |
//! | `cms reindex <type>` | Rebuild a type's search index |
//! | `cms export <type>` | Export a type as CSV or JSON |
//! | `cms user add <email>` | Create an admin user |
//! | `cms analytics` | Print the 14-day request chart |
//!
//! ## Examples
//!
//! ```bash
//! cms init
//! cms search Review "+coffee -decaf"
//! cms list Song --count 20 --offset 1
//! cms export Review --format csv --output ./reviews.csv
//! cms serve
//! ```

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use content_engine::{commands, config, export, logging, server};

/// Content Engine CLI: a typed content store with search, uploads and
/// request analytics.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file is only tolerated by `init`, which then uses
/// defaults rooted at the current directory.
#[derive(Parser)]
#[command(
    name = "cms",
    about = "Content Engine: typed content store, search and analytics",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cms.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create stores, buckets and search indexes.
    ///
    /// Idempotent: existing data is kept.
    Init,

    /// Start the content HTTP API.
    ///
    /// Binds to `[server].bind` and runs the analytics recorder until
    /// interrupted.
    Serve,

    /// Full-text search within one content type.
    Search {
        /// Content type, e.g. `Review`.
        type_name: String,

        /// Query string: terms, `+required`, `-excluded`, `field:term`,
        /// `"phrases"`, `prefix*`.
        query: String,

        /// Maximum number of hits.
        #[arg(long, default_value_t = 10)]
        count: i64,

        /// Hits to skip.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// List one page of a content type.
    List {
        type_name: String,

        /// Page size; `-1` lists everything.
        #[arg(long, default_value_t = 10)]
        count: i64,

        /// Page number, starting at 0.
        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// `desc` (newest first) or `asc`.
        #[arg(long, default_value = "desc")]
        order: String,
    },

    /// Print one record as JSON.
    Get {
        /// Record address, `Type:id` (e.g. `Review:1`, `Review__pending:3`).
        target: String,
    },

    /// Drop and rebuild a type's search index.
    Reindex { type_name: String },

    /// Export every record of a type.
    Export {
        type_name: String,

        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Manage admin users.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Print request counts for the last 14 days.
    Analytics,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a user with a password credential.
    Add {
        email: String,

        #[arg(long)]
        password: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

impl From<Format> for export::ExportFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Csv => export::ExportFormat::Csv,
            Format::Json => export::ExportFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "cms", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = match (&cli.command, cli.config.exists()) {
        (Commands::Init, false) => {
            let root = std::env::current_dir()?;
            eprintln!(
                "No config at {}, using defaults under {}",
                cli.config.display(),
                root.display()
            );
            config::Config::minimal(&root)
        }
        _ => config::load_config(&cli.config)?,
    };
    logging::init(&cfg.log);

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Serve => {
            let engine = commands::open(&cfg).await?;
            server::run_server(engine).await?;
        }
        Commands::Search {
            type_name,
            query,
            count,
            offset,
        } => {
            commands::run_search(&cfg, &type_name, &query, count, offset).await?;
        }
        Commands::List {
            type_name,
            count,
            offset,
            order,
        } => {
            commands::run_list(&cfg, &type_name, count, offset, &order).await?;
        }
        Commands::Get { target } => {
            commands::run_get(&cfg, &target).await?;
        }
        Commands::Reindex { type_name } => {
            commands::run_reindex(&cfg, &type_name).await?;
        }
        Commands::Export {
            type_name,
            format,
            output,
        } => {
            let engine = commands::open(&cfg).await?;
            export::run_export(engine.repo(), &type_name, format.into(), output.as_deref())
                .await?;
            engine.close().await;
        }
        Commands::User { action } => match action {
            UserAction::Add { email, password } => {
                commands::run_user_add(&cfg, &email, &password).await?;
            }
        },
        Commands::Analytics => {
            commands::run_analytics(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
