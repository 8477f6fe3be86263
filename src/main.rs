use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use sessiongate_server::{AppState, AppError, Settings};
use sessiongate_server::auth::handlers::configure;
use dotenv::dotenv;
use std::net::TcpListener;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> sessiongate_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging, `RUST_LOG` overrides the default level
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new()?;
    info!("Configuration loaded ({} environment)", config.environment);

    let state = AppState::new(config.clone()).await?;
    let state = web::Data::new(state);

    // Evict idle rate windows
    let sweep_state = state.clone();
    let sweep_every = Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let evicted = sweep_state.rate_limiter.sweep(sweep_state.clock.now()).await;
            if evicted > 0 {
                debug!("Rate limiter sweep evicted {} windows", evicted);
            }
        }
    });

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    let production = config.environment == "production";
    HttpServer::new(move || {
        let cors = if production {
            Cors::default()
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec!["Authorization", "Content-Type"])
                .max_age(3600)
        } else {
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600)
        };

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .configure(configure)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
