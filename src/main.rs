mod cli;
mod domain;
mod infrastructure;

use clap::Parser;
use cli::Cli;
use domain::error::BridgeError;
use domain::models::DisconnectReason;
use domain::settings::{Settings, SettingsService};
use infrastructure::bluetooth::{BtleTransport, RingService};
use infrastructure::oscquery::{OscQueryServer, TelemetryPublisher};
use infrastructure::shutdown;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings_service = match SettingsService::new() {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to load settings: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    // Held back until the subscriber exists
    let mut startup_warnings: Vec<String> =
        settings_service.load_error().map(str::to_string).into_iter().collect();
    startup_warnings.extend(
        settings_service
            .get_mut()
            .apply_overrides(|key| std::env::var(key).ok()),
    );
    cli.apply(settings_service.get_mut());

    let _logging_guard = match infrastructure::logging::init_logger(
        &settings_service.get().log_settings,
    ) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        }
    };

    info!("Starting ring-bridge {}", env!("CARGO_PKG_VERSION"));
    for warning in &startup_warnings {
        warn!("{}", warning);
    }
    if cli.save_settings {
        match settings_service.save() {
            Ok(()) => info!("Settings saved to {}", settings_service.path().display()),
            Err(e) => warn!("Failed to save settings: {:#}", e),
        }
    }

    match run(cli.device.as_deref(), settings_service.get()).await {
        Ok(reason) => {
            info!("Stopped: {}", reason);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<BridgeError>()
                .map(BridgeError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

/// Serve OSCQuery and stream from the ring until Ctrl+C or a terminal error
async fn run(identifier: Option<&str>, settings: &Settings) -> anyhow::Result<DisconnectReason> {
    let (trigger, shutdown) = shutdown::channel();
    let trigger = Arc::new(trigger);

    let ctrl_c = trigger.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down...");
            ctrl_c.trigger();
        }
    });

    let publisher = TelemetryPublisher::new();
    let server = OscQueryServer::new(publisher.clone(), settings.oscquery.clone());
    let listener = server.bind().await?;
    let server_task = tokio::spawn(server.serve(listener, shutdown.clone()));

    let transport = BtleTransport::new().await?;
    let service = RingService::new(transport, settings, Arc::new(publisher))?;

    let mut status = service.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let state = *status.borrow_and_update();
            info!("Ring: {}", state);
        }
    });

    let outcome = service.run(identifier, shutdown).await;

    trigger.trigger();
    match server_task.await {
        Ok(Err(e)) => warn!("OSCQuery server failed: {:#}", e),
        Err(e) => warn!("OSCQuery server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(outcome?)
}
