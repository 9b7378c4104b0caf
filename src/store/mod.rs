use std::time::Duration;

use chrono::Utc;
use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PoolError},
    ExpressionMethods, QueryDsl, RunQueryDsl, SelectableHelper, SqliteConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;
use tracing::{debug, trace};

use self::model::{NewPrediction, Prediction};

pub mod model;
mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// How long a statement waits on a locked database, and how long the pool waits for a free
/// connection, before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Could not get a database connection: {0}")]
    Pool(#[from] PoolError),
    #[error("Could not initialize database: {0}")]
    DbInit(Box<dyn std::error::Error + Send + Sync>),
    #[error("SQL execute error: {0} at {1}")]
    SqlError(diesel::result::Error, String),
    #[error("Store task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    fn from_diesel_error(err: diesel::result::Error, context: String) -> StoreError {
        StoreError::SqlError(err, context)
    }
}

#[derive(Debug)]
struct Pragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for Pragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;",
            BUSY_TIMEOUT.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Handle to the prediction database. Cheap to clone, every clone shares one pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    /// Opens the pool and brings the schema up to date. Meant to run once, before serving.
    pub fn connect(url: &str, pool_size: u32) -> Result<Store, StoreError> {
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(BUSY_TIMEOUT)
            .connection_customizer(Box::new(Pragmas))
            .build(ConnectionManager::<SqliteConnection>::new(url))?;

        let mut conn = pool.get()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(StoreError::DbInit)?;
        debug!("Applied {} pending migrations", applied.len());
        drop(conn);

        Ok(Store { pool })
    }

    /// Runs `func` against a pooled connection on the blocking thread pool, so a slow query
    /// never stalls the async workers.
    pub async fn execute<F, R>(&self, func: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            func(&mut conn)
        })
        .await?
    }

    pub async fn insert(&self, prediction: NewPrediction) -> Result<Prediction, StoreError> {
        self.execute(move |conn| insert_prediction(conn, &prediction))
            .await
    }

    pub async fn latest(&self, limit: u32) -> Result<Vec<Prediction>, StoreError> {
        self.execute(move |conn| latest_predictions(conn, limit))
            .await
    }

    pub async fn delete_all(&self) -> Result<usize, StoreError> {
        self.execute(delete_all_predictions).await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

fn insert_prediction(
    conn: &mut SqliteConnection,
    prediction: &NewPrediction,
) -> Result<Prediction, StoreError> {
    use schema::predictions::dsl::*;

    let now = Utc::now().naive_utc();
    let inserted = diesel::insert_into(predictions)
        .values((prediction, created_at.eq(now), updated_at.eq(now)))
        .returning(Prediction::as_returning())
        .get_result(conn)
        .map_err(|err| {
            StoreError::from_diesel_error(err, format!("Insert prediction {:?}", prediction.name))
        })?;
    trace!("Inserted prediction {}", inserted.id);
    Ok(inserted)
}

fn latest_predictions(
    conn: &mut SqliteConnection,
    limit: u32,
) -> Result<Vec<Prediction>, StoreError> {
    use schema::predictions::dsl::*;

    predictions
        .order((created_at.desc(), id.desc()))
        .limit(i64::from(limit))
        .select(Prediction::as_select())
        .load(conn)
        .map_err(|err| StoreError::from_diesel_error(err, format!("List {limit} predictions")))
}

fn delete_all_predictions(conn: &mut SqliteConnection) -> Result<usize, StoreError> {
    use schema::predictions::dsl::*;

    diesel::delete(predictions)
        .execute(conn)
        .map_err(|err| StoreError::from_diesel_error(err, "Delete all predictions".to_owned()))
}
