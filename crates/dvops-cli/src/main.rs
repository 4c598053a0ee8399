mod cmd;
mod output;
mod session;

use clap::{Parser, Subcommand};
use cmd::{
    attachments::AttachmentArgs,
    batch::{BatchArgs, Operation},
    config::ConfigSubcommand,
    runs::RunsSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dvops",
    about = "Resolve, merge and bulk-update Dataverse records from row files",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ./dvops.yaml if present)
    #[arg(long, global = true, env = "DVOPS_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge duplicate records into their masters
    Merge(BatchArgs),

    /// Apply field updates to existing records
    Update(BatchArgs),

    /// Create records from row fields
    Create(BatchArgs),

    /// Deactivate records and leave a note saying why
    Deactivate {
        #[command(flatten)]
        batch: BatchArgs,

        /// Reason recorded in the deactivation note
        #[arg(long, default_value = "Deactivated by batch")]
        reason: String,

        /// Operator recorded in the deactivation note
        #[arg(long, env = "DVOPS_OPERATOR", default_value = "dvops")]
        performed_by: String,
    },

    /// Reactivate records and remove their latest deactivation note
    Reactivate(BatchArgs),

    /// Resolve target keys to record ids without changing anything
    Resolve {
        /// Row file (YAML or JSON)
        rows: PathBuf,
    },

    /// Download note files and email attachments from record timelines
    Attachments(AttachmentArgs),

    /// Validate a row file offline
    Check {
        /// Row file (YAML or JSON)
        rows: PathBuf,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Fetch an access token and show when it expires
    Token,

    /// Browse recorded batch runs
    Runs {
        #[command(subcommand)]
        subcommand: RunsSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Merge(_)
        | Commands::Update(_)
        | Commands::Create(_)
        | Commands::Deactivate { .. }
        | Commands::Reactivate(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Merge(args) => cmd::batch::run(config, Operation::Merge, args, cli.json),
        Commands::Update(args) => cmd::batch::run(config, Operation::Update, args, cli.json),
        Commands::Create(args) => cmd::batch::run(config, Operation::Create, args, cli.json),
        Commands::Deactivate {
            batch,
            reason,
            performed_by,
        } => cmd::batch::run(
            config,
            Operation::Deactivate {
                reason,
                performed_by,
            },
            batch,
            cli.json,
        ),
        Commands::Reactivate(args) => {
            cmd::batch::run(config, Operation::Reactivate, args, cli.json)
        }
        Commands::Resolve { rows } => cmd::resolve::run(config, &rows, cli.json),
        Commands::Attachments(args) => cmd::attachments::run(config, args, cli.json),
        Commands::Check { rows } => cmd::check::run(config, &rows, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
        Commands::Token => cmd::token::run(config, cli.json),
        Commands::Runs { subcommand } => cmd::runs::run(config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
