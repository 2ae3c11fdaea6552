use clap::Parser;
use slack_reactions::{Cli, Commands, Settings, commands, telemetry};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    telemetry::init_tracing(&settings.logging);

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after in-flight pages");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::InitConfig { force } => commands::run_init_config(&cli.config, force),
        Commands::SyncChannels => commands::run_sync_channels(&settings).await,
        Commands::Aggregate {
            channels,
            days,
            workers,
        } => commands::run_aggregate(&settings, channels, days, workers, cancel).await,
        Commands::Status => commands::run_status(&settings).await,
        Commands::Reset { channel } => commands::run_reset(&settings, &channel).await,
        Commands::ExportEmojis { output } => commands::run_export_emojis(&output).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
