use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tpdm-cli")]
#[command(about = "Reconcile SIS teacher candidates into a TPDM record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and write the run report.
    Sync(SyncArgs),
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Build and count records without sending upserts or deletes.
    #[arg(long)]
    dry_run: bool,
    /// Write each candidate payload under the output directory.
    #[arg(long)]
    dump_payloads: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let mut config = tpdm_sync::SyncConfig::from_env();
            if args.dry_run {
                config.save_to_store = false;
            }
            if args.dump_payloads {
                config.output_data_to_dir = true;
            }

            info!(
                dry_run = !config.save_to_store,
                dump_payloads = config.output_data_to_dir,
                "starting teacher candidate sync"
            );
            let report = tpdm_sync::run_sync_once(&config).await?;
            println!("{}", report.render());
            if let Some(fatal) = &report.fatal {
                bail!("sync run {} aborted: {}", report.run_id, fatal.message);
            }
        }
    }

    Ok(())
}
