use gateward::config::Config;
use gateward::error::EXIT_CONFIG;
use gateward::lifecycle::LifecycleController;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gateward=info".parse().expect("valid log directive")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Best-effort creation of the persistent storage root before the
    // backend needs it
    if let Some(ref data_dir) = config.data_dir {
        if let Err(e) = std::fs::create_dir_all(data_dir) {
            error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
            std::process::exit(EXIT_CONFIG);
        }
    }

    info!(
        listen_port = config.listen_port,
        backend_port = config.backend_port,
        command = ?config.backend_command,
        args = ?config.backend_args,
        health_path = ?config.health_path,
        startup_timeout_secs = config.startup_timeout_secs,
        shutdown_grace_secs = config.shutdown_grace_secs,
        restart_max = config.restart_max,
        restart_window_secs = config.restart_window_secs,
        "Starting gateway supervisor"
    );

    let (term_tx, term_rx) = watch::channel(false);

    // Wire termination signals to the lifecycle controller
    tokio::spawn(async move {
        wait_for_termination_signal().await;
        let _ = term_tx.send(true);
    });

    let controller = match LifecycleController::new(config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "Failed to start proxy server");
            std::process::exit(e.exit_code());
        }
    };

    match controller.run(term_rx).await {
        Ok(()) => {
            info!("Clean shutdown");
        }
        Err(e) => {
            error!(error = %e, "Fatal supervisor error");
            std::process::exit(e.exit_code());
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}
