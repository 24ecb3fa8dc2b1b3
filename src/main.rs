//! Binary entry point: loads configuration, provisions the database and
//! notification bus, and starts serving. Grounded in the teacher's
//! `examples/chat/src/main.rs` startup sequence (`dotenvy::dotenv()`, build
//! shared state, register routes, `listen`).

use std::process::ExitCode;
use std::sync::Arc;

use plumage::catalog::Catalog;
use plumage::config::Config;
use plumage::events::EventBus;
use plumage::http::app;
use plumage::routes;
use plumage::state::AppState;
use plumage::{db, error::Error};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(error) = dotenvy::dotenv() {
        tracing::warn!(%error, "no .env file loaded");
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(status = %error.status(), message = %error.message(), "server failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Error> {
    let config = Config::from_env()?;
    let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    db::run_migrations(&config.database_url)?;
    let pool = db::establish_pool(&config.database_url).await?;

    let catalog = Arc::new(Catalog::empty());
    {
        let mut conn = pool.get().await.map_err(|error| plumage::err!(500, message = format!("failed to acquire connection: {error}")))?;
        catalog.load(&mut conn).await?;
    }

    let events = Arc::new(EventBus::connect(&config.redis_url, node_id.clone()).await?);
    events.listen().await?;

    let state = AppState::new(pool, catalog, events, config.session_key, node_id);
    let mut app = app(state);
    routes::configure(&mut app);

    app.listen(config.addr).await
}
