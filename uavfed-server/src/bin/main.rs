use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;
use uavfed_server::{runtime::CoordinatorService, settings::Settings};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        round: round_settings,
        model: model_settings,
        evaluation: evaluation_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let model = model_settings.model(&evaluation_settings);
    let (mut service, event_subscriber) =
        CoordinatorService::init(&api_settings, round_settings.params(), model).await?;

    let mut phases = event_subscriber.phase_listener();
    tokio::spawn(async move {
        while let Some(phase) = phases.next().await {
            debug!("round {}: entering phase {}", phase.round_id, phase.event);
        }
    });

    tokio::select! {
        _ = service.run() => {
            warn!("shutting down: event loop terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    service.coordinator().log_summary();
    Ok(())
}
