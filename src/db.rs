//! The query connection pool. Feather tables are created and altered at
//! runtime (see `catalog`), so catalog/CRUD SQL goes through
//! `diesel::sql_query` rather than a compile-time `diesel::table!` schema;
//! only the handful of genuinely static system tables get typed models.
//! Grounded in the teacher's `examples/chat` `src/database/mod.rs`.

use bb8::{ManageConnection, Pool, PooledConnection, RunError};
use diesel::Connection as _;
use diesel::pg::PgConnection;
use diesel_async::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

pub type ConnectionManager = AsyncDieselConnectionManager<AsyncPgConnection>;
pub type Connection<'a> = PooledConnection<'a, ConnectionManager>;
pub type ConnectionError = RunError<<ConnectionManager as ManageConnection>::Error>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs the (small, fixed) set of system-table migrations over a plain
/// synchronous connection. `diesel_migrations::MigrationHarness` only
/// targets `diesel::Connection`, not `diesel-async`'s pool, so this opens
/// and drops a one-off `PgConnection` purely to provision schema before the
/// async pool starts serving requests.
pub fn run_migrations(database_url: &str) -> crate::error::Result<()> {
    let mut connection = PgConnection::establish(database_url)
        .map_err(|error| crate::err!(500, message = format!("failed to connect for migrations: {error}")))?;

    connection
        .run_pending_migrations(MIGRATIONS)
        .map_err(|error| crate::err!(500, message = format!("failed to run migrations: {error}")))?;

    Ok(())
}

pub async fn establish_pool(database_url: &str) -> crate::error::Result<Pool<ConnectionManager>> {
    let manager = ConnectionManager::new(database_url);

    Pool::builder()
        .build(manager)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to establish database pool: {error}")))
}
