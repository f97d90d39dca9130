use actix_web::{middleware, web, App, HttpServer};
use sofadb::Engine;

mod handlers;

/// Request bodies (documents, bulk envelopes) are capped at 1 MiB.
const MAX_BODY_BYTES: usize = 1_048_576;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    log::info!("Starting SofaDB server");

    let data_dir = std::env::var("SOFADB_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let host = std::env::var("SOFADB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("SOFADB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5984);

    log::info!("Opening data directory: {data_dir}");
    let engine = Engine::new(std::path::Path::new(&data_dir)).expect("Failed to open data directory");

    let state = web::Data::new(engine);

    log::info!("Listening on {host}:{port}");
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
            .wrap(middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
