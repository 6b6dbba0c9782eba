mod audio;
mod config;
mod console;
mod error;
mod messages;
mod recording;
mod remote;
mod services;

use config::Config;
use messages::ControlCommand;
use remote::HttpRemote;
use services::{Controller, Recorder, RecorderHandle};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting remote-recorder capture agent");

    let config = Config::load()?;
    config.validate()?;

    // Recorder holds cpal::Stream, which is !Send, so it lives on a LocalSet
    let local = tokio::task::LocalSet::new();

    local.run_until(async move { run_app(config).await }).await
}

async fn run_app(config: Config) -> Result<()> {
    let recorder = setup_recorder(&config);
    let remote = Arc::new(HttpRemote::new(&config)?);

    let controller = Arc::new(Controller::new(
        Arc::new(recorder),
        remote,
        config.poll_interval(),
        config.keep_recordings,
    ));

    tokio::spawn(console::show_status(controller.subscribe()));

    let (control_tx, mut control_rx) = mpsc::channel(10);
    tokio::spawn(async move {
        if let Err(e) = console::read_commands(control_tx).await {
            tracing::warn!("Console input stopped: {:#}", e);
        }
    });

    controller.start();

    tracing::info!(
        "Ready! Polling {} every {}s. Type start, stop, status or quit.",
        config.endpoint,
        config.poll_interval_secs
    );

    loop {
        tokio::select! {
            Some(cmd) = control_rx.recv() => match cmd {
                ControlCommand::Start => controller.manual_start().await,
                ControlCommand::Stop => controller.manual_stop().await,
                ControlCommand::Status => {
                    tracing::info!("Capture state: {:?}", controller.state().await);
                }
                ControlCommand::Quit => {
                    tracing::info!("Quit requested, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    controller.shutdown(config.shutdown_grace()).await;

    tracing::info!("remote-recorder shutdown complete");
    Ok(())
}

fn setup_recorder(config: &Config) -> RecorderHandle {
    let recordings_dir = config.recordings_dir();
    tracing::info!("Recordings are written to {:?}", recordings_dir);

    // Spawned with spawn_local because the Recorder is !Send
    let (recorder_tx, recorder_rx) = mpsc::channel(10);
    let recorder = Recorder::new(config.audio_format(), recordings_dir, recorder_rx);
    tokio::task::spawn_local(recorder.run());

    RecorderHandle::new(recorder_tx)
}
