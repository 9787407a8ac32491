use actix_web::{middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::{error, info, warn};
use std::io;

use subtitle_api::config_loader::load_config;
use subtitle_api::handlers::configure;
use subtitle_api::metrics::{create_metrics_exporter, Metrics};
use subtitle_api::{MetricsConfig, Orchestrator, PipelineConfig, ServerConfig};

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if load_config() {
        info!("Loaded configuration file");
    }

    // Load configurations
    let server_config = ServerConfig::default();
    let pipeline_config = PipelineConfig::default();
    let metrics_config = MetricsConfig::default();

    if let Err(e) = pipeline_config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()));
    }

    // Initialize metrics
    let metrics = match create_metrics_exporter(
        &metrics_config.exporter_type,
        metrics_config.namespace.as_deref(),
    ) {
        Ok(exporter) => Metrics::new(exporter),
        Err(e) => {
            warn!("{}; metrics disabled", e);
            Metrics::disabled()
        }
    };

    // Create work directory if it doesn't exist
    let work_dir = pipeline_config.work_dir.clone();
    if let Err(e) = std::fs::create_dir_all(&work_dir) {
        warn!("Failed to create work directory {}: {}", work_dir.display(), e);
    }

    info!("Starting subtitle API server on http://{}:{}", server_config.host, server_config.port);
    info!("Using work directory: {}", work_dir.display());
    info!("ffmpeg command: {}", pipeline_config.ffmpeg_cmd);
    info!("yt-dlp command: {}", pipeline_config.ytdlp_cmd);
    info!("Whisper command: {} (model {})", pipeline_config.whisper.command_path, pipeline_config.whisper.model);
    info!("Metrics exporter: {}", metrics_config.exporter_type);

    let orchestrator = Orchestrator::from_config(pipeline_config, metrics.clone());
    orchestrator.start_reaper();

    let timeout = server_config.client_timeout;
    let keep_alive = server_config.keep_alive;
    let bind = (server_config.host.clone(), server_config.port);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(orchestrator.clone()))
            .app_data(web::Data::new(server_config.clone()))
            .app_data(web::Data::new(metrics.clone()))
            .configure(configure)
    })
    .bind(bind)?
    .client_disconnect_timeout(timeout)
    .keep_alive(keep_alive)
    .run()
    .await
}
