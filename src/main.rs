//! xtunneld/src/main.rs
//! Thin binary entrypoint: load configuration, initialize logging, run
//! the service until a fatal error or shutdown signal.

use xtunneld::{logging, Service};

#[tokio::main]
async fn main() {
    logging::init_logging("info");

    let config = xtunneld::ServerConfig::default();
    tracing::info!(
        bind_port = config.bind_port,
        vhost_http_port = config.vhost_http_port,
        vhost_https_port = config.vhost_https_port,
        "starting tunnel server"
    );

    let service = Service::new(config);
    if let Err(e) = service.run().await {
        tracing::error!(error = %e, "service exited with error");
        std::process::exit(1);
    }
}
