use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "sponge",
    about = "Sponge — declarative cloud environment provisioning",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to the state database
    #[arg(long, global = true, default_value = ".sponge/state.redb")]
    state: PathBuf,
    /// Path to the environment parameters
    #[arg(short, long, global = true, default_value = "sponge.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter sponge.toml
    Init {
        /// Environment name
        #[arg(short, long, default_value = "dev")]
        environment: String,
        #[arg(short, long, default_value = "us-east-1")]
        region: String,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the parameters and show the computed modules and subnets
    Validate {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Show what an apply would change
    Plan {
        /// Show what a destroy would remove instead
        #[arg(long)]
        destroy: bool,
    },
    /// Converge the environment onto its parameters
    Apply {
        /// Apply only this module (its dependencies must already be applied)
        #[arg(short, long)]
        module: Option<String>,
    },
    /// Tear down every module of the environment
    Destroy,
    /// Print the environment's outputs
    Output {
        /// Print sensitive values in clear text
        #[arg(long)]
        show_sensitive: bool,
    },
    /// Inspect recorded state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Remove a stale apply lock
    ForceUnlock {
        /// Environment to unlock (default: the one in the config)
        #[arg(short, long)]
        environment: Option<String>,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// List recorded modules of every environment
    List,
    /// Show recent apply and destroy runs
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sponge=info".parse()?)
        )
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context {
        state: cli.state,
        config: cli.config,
    };

    match cli.command {
        Commands::Init {
            environment,
            region,
            force,
        } => commands::init::init(&ctx, &environment, &region, force),
        Commands::Validate { format } => commands::validate::validate(&ctx, &format),
        Commands::Plan { destroy } => commands::apply::plan(&ctx, destroy).await,
        Commands::Apply { module } => commands::apply::apply(&ctx, module.as_deref()).await,
        Commands::Destroy => commands::apply::destroy(&ctx).await,
        Commands::Output { show_sensitive } => commands::output::output(&ctx, show_sensitive),
        Commands::State { action } => match action {
            StateAction::List => commands::state::list(&ctx),
            StateAction::History { limit } => commands::state::history(&ctx, limit),
        },
        Commands::ForceUnlock { environment } => {
            commands::state::force_unlock(&ctx, environment.as_deref())
        }
    }
}
