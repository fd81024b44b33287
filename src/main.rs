use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use turnstile::Config;
use turnstile::server::{bootstrap, serve, shutdown_signal};

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.to_owned());

    let config = Config::load_from_file(&path)
        .and_then(Config::into_runtime)
        .unwrap_or_else(|e| {
            error!(error = %e, config = %path, "invalid configuration");
            std::process::exit(1);
        });

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        error!(error = %e, addr = %config.listen, "failed to bind listener");
        std::process::exit(1);
    });

    let boot = bootstrap(&config).await.unwrap_or_else(|e| {
        error!(error = %e, "failed to start gateway");
        std::process::exit(1);
    });

    info!(addr = %config.listen, "listening");
    serve(listener, boot.state, shutdown_signal()).await;

    for task in boot.tasks {
        task.abort();
    }
}
