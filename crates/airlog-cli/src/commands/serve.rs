use std::path::Path;

use airlog_core::{Pipeline, PipelineConfig, PipelineError};
use airlog_server::ServerConfig;
use log::{error, info};

pub struct ServeCommandConfig<'a> {
    pub db: &'a Path,
    pub host: &'a str,
    pub port: u16,
    pub interval_secs: f64,
    pub static_dir: &'a Path,
    pub sensor: super::SensorSpec,
}

pub fn run(cfg: ServeCommandConfig<'_>) {
    let interval = match super::parse_interval(cfg.interval_secs) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let sensor = match super::make_sensor(&cfg.sensor) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let base = format!("http://{}:{}", cfg.host, cfg.port);
    println!("🌡  airlog v{}", airlog_core::VERSION);
    println!("   {base}");
    println!("   sensor:   {}", sensor.info().description);
    println!("   database: {}", cfg.db.display());
    println!("   interval: {:.1}s", interval.as_secs_f64());
    println!();
    println!("   Endpoints:");
    println!("     GET /                 Dashboard");
    println!("     GET /api/latest       Most recent reading");
    println!("     GET /api/history      Recent readings, newest first (?limit=1..1000)");
    println!("     GET /metrics          Prometheus gauges");
    println!("     GET /ws               Live stream (WebSocket)");
    println!();

    let pipeline_config = PipelineConfig::new(cfg.db).with_interval(interval);
    let server_config = ServerConfig {
        host: cfg.host.to_string(),
        port: cfg.port,
        static_dir: cfg.static_dir.to_path_buf(),
        ..ServerConfig::default()
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let ok = rt.block_on(async move {
        let pipeline = match Pipeline::start(pipeline_config, sensor).await {
            Ok(p) => p,
            Err(PipelineError::Init(e)) => {
                super::report_init_error(&e);
                return false;
            }
            Err(e) => {
                eprintln!("Error: {e}");
                return false;
            }
        };

        let services = pipeline.services();
        let broadcaster = services.broadcaster.clone();
        let shutdown = async move {
            shutdown_signal().await;
            info!("Shutdown requested");
            broadcaster.close_all();
        };

        let served = airlog_server::run_server(services, server_config, shutdown).await;
        if let Err(e) = &served {
            error!("HTTP server failed: {e}");
        }

        match pipeline.shutdown().await {
            Ok(report) => {
                println!(
                    "Stopped: {} ticks, {} readings persisted, {} dropped, {} failed writes",
                    report.poller.ticks,
                    report.writer.written,
                    report.poller.dropped,
                    report.writer.failed
                );
                served.is_ok()
            }
            Err(e) => {
                eprintln!("Error during shutdown: {e}");
                false
            }
        }
    });

    if !ok {
        std::process::exit(1);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Installing Ctrl-C handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Installing SIGTERM handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
