use inkbrawl::{db, routes, services, state};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let stroke_persist_tx = services::persistence::spawn_stroke_persist_worker(pool.clone());
    let state = state::AppState::new(pool, Some(stroke_persist_tx));

    // Recover the stroke log and retire orphaned sessions before serving.
    services::persistence::hydrate(&state)
        .await
        .expect("world hydration failed");

    // Spawn background tasks: session flush and the stale-session reaper.
    let _persistence = services::persistence::spawn_persistence_task(state.clone());
    let _reaper = services::reaper::spawn_reaper_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "inkbrawl listening");
    axum::serve(listener, app).await.expect("server failed");
}
