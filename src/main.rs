use tokio::net::TcpListener;
use tracing::info;

use slotkeep::app::App;
use slotkeep::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotkeep::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let app = App::open(config.clone())?;
    app.start();

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotkeep listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  subscriber_buffer: {}", config.subscriber_buffer);
    info!("  strict_booking: {}", config.strict_booking);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, end event streams, then drain the worker
    let token = app.shutdown_token();
    axum::serve(listener, app.router())
        .with_graceful_shutdown(async move {
            slotkeep::http::shutdown_signal().await;
            token.cancel();
        })
        .await?;
    info!("shutdown signal received, HTTP server stopped");

    app.shutdown().await;
    info!("slotkeep stopped");
    Ok(())
}
