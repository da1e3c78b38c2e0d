use clap::Parser;
use log::{error, info};
use pingora::prelude::*;
use pingora::server::configuration::Opt;
use pingora_guard::{
    ApiKeyManager, GuardProxy, MemoryKeyStore, MetricsCollector, SecurityConfig, SecurityPipeline,
};
use pingora_proxy::http_proxy_service;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/guard.yaml")]
    config: String,

    /// Upstream backend host
    #[arg(short = 'u', long)]
    upstream_host: Option<String>,

    /// Upstream backend port
    #[arg(short = 'p', long)]
    upstream_port: Option<u16>,

    /// Proxy listening address
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// Proxy listening port
    #[arg(short = 'P', long, default_value = "6188")]
    listen_port: u16,

    /// Metrics port
    #[arg(short = 'm', long, default_value = "6190")]
    metrics_port: u16,

    /// Seconds between maintenance sweeps
    #[arg(long, default_value = "300")]
    maintenance_interval: u64,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    info!("Starting pingora-guard...");
    info!("Loading configuration from: {}", args.config);

    let mut config = SecurityConfig::from_file(&args.config).unwrap_or_else(|e| {
        error!("Failed to load configuration from {}: {}", args.config, e);
        error!("Using default configuration");
        SecurityConfig::default()
    });
    config.apply_env_overrides();

    let key_manager = Arc::new(ApiKeyManager::new(
        Arc::new(MemoryKeyStore::new()),
        &config.api_keys,
    ));

    let pipeline = match SecurityPipeline::new(&config) {
        Ok(pipeline) => Arc::new(pipeline.with_api_keys(key_manager)),
        Err(e) => {
            error!("Invalid security configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = pipeline
        .clone()
        .spawn_maintenance(Duration::from_secs(args.maintenance_interval.max(1)))
    {
        error!("Failed to start maintenance thread: {}", e);
    }

    let metrics = Arc::new(MetricsCollector::new());

    let upstream_host = args
        .upstream_host
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let upstream_port = args.upstream_port.unwrap_or(8080);

    info!("Upstream backend: {}:{}", upstream_host, upstream_port);

    let guard_proxy = GuardProxy::new(
        (upstream_host.clone(), upstream_port),
        pipeline,
        metrics,
        config.max_request_size,
        config.trusted_proxy_networks(),
    );

    let mut server = match Server::new(Some(Opt::default())) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, guard_proxy);
    let listen_address = format!("{}:{}", args.listen_addr, args.listen_port);
    proxy_service.add_tcp(&listen_address);
    server.add_service(proxy_service);

    // Built-in Prometheus service for the proxy counters
    let metrics_address = format!("{}:{}", args.listen_addr, args.metrics_port);
    let mut prometheus_service_http =
        pingora::services::listening::Service::prometheus_http_service();
    prometheus_service_http.add_tcp(&metrics_address);
    server.add_service(prometheus_service_http);

    info!("Guard proxy:  http://{}", listen_address);
    info!("Metrics:      http://{}/metrics", metrics_address);
    info!("Upstream:     {}:{}", upstream_host, upstream_port);
    info!("Config:       {}", args.config);

    server.run_forever();
}
