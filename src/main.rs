use log::{error, info};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use tokio::sync::mpsc;

use pinsync::{
    AppConfig, AppState, BackendKind, BroadcastNotifier, GpioBackend, GpioController,
    MockGpioBackend, SysfsBaseOffset,
};

#[cfg(feature = "hardware-gpio")]
use pinsync::LibgpiodBackend;
#[cfg(feature = "sysfs-gpio")]
use pinsync::SysfsBackend;

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PINSYNC_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let backend_kind = config.gpio.backend;
    match backend_kind {
        #[cfg(feature = "hardware-gpio")]
        BackendKind::Libgpiod => {
            let backend = Arc::new(
                LibgpiodBackend::new(config.gpio.chip.clone())
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            );
            serve(config, backend).await
        }
        #[cfg(feature = "sysfs-gpio")]
        BackendKind::Sysfs => {
            let backend = Arc::new(SysfsBackend::new(config.gpio.sysfs_root.clone()));
            serve(config, backend).await
        }
        BackendKind::Mock => serve(config, Arc::new(MockGpioBackend::default())).await,
        #[allow(unreachable_patterns)]
        other => panic!("Config error: backend {other:?} is not compiled into this build"),
    }
}

async fn serve<B: GpioBackend + 'static>(config: AppConfig, backend: Arc<B>) -> io::Result<()> {
    let notifier = Arc::new(BroadcastNotifier::new(config.notify_capacity));
    let probe = Arc::new(SysfsBaseOffset::new(
        config.gpio.sysfs_root.clone(),
        config.gpio.chip_label_prefix.clone(),
    ));
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();

    let controller = Arc::new(GpioController::new(
        backend,
        probe,
        notifier.clone(),
        fault_tx,
    ));
    match controller.init(&config.pins).await {
        Ok(status) => info!("GPIO status: {:?}", status.state),
        Err(e) => error!("GPIO setup failed: {e}"),
    }

    let app_state = AppState {
        controller: controller.clone(),
        notifier,
    };

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        _ => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    let server = server.run();
    let handle = server.handle();
    tokio::pin!(server);

    let fault = tokio::select! {
        result = &mut server => {
            controller.shutdown().await;
            return result;
        }
        Some(fault) = fault_rx.recv() => fault,
    };

    error!("Fatal GPIO fault, shutting down: {fault}");
    let (_, stopped) = tokio::join!(handle.stop(false), server);
    if let Err(e) = stopped {
        error!("Server stopped with error: {e}");
    }
    controller.shutdown().await;

    Err(io::Error::other(fault.to_string()))
}
