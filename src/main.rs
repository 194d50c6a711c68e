mod constants;
mod extractor;
mod models;
mod routes;
mod services;
mod storage;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tower_http::cors::CorsLayer;

use crate::extractor::Extractor;
use crate::storage::Storage;

pub struct AppState {
    pub storage: Arc<Storage>,
    pub extractor: Extractor,
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    let storage = Arc::new(Storage::from_env());
    let extractor = Extractor::new(storage.clone());
    let state = Arc::new(AppState { storage, extractor });

    let app = routes::build_routes()
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(constants::MAX_VIDEO_UPLOAD_SIZE))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", addr, e));

    println!("Listening on http://{}", addr);
    axum::serve(listener, app).await.expect("Server failed");
}
