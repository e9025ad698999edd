pub mod provision;
pub mod upsert;

use deadpool_postgres::{Config, CreatePoolError, Pool, PoolConfig, Runtime};
use tokio_postgres::NoTls;
use tracing::info;

use crate::config::DbConfig;

#[derive(Clone)]
pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    pub fn new(cfg: &DbConfig) -> Result<Self, CreatePoolError> {
        let mut pg = Config::new();
        pg.host = Some(cfg.host.clone());
        pg.port = Some(cfg.port);
        pg.user = Some(cfg.user.clone());
        pg.password = Some(cfg.password.clone());
        pg.dbname = Some(cfg.database.clone());
        if let Some(size) = cfg.pool_size {
            pg.pool = Some(PoolConfig::new(size));
        }
        let pool = pg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        info!(
            host = %cfg.host,
            database = %cfg.database,
            "database connection pool created"
        );
        Ok(Self { pool })
    }

    pub async fn get_client(
        &self,
    ) -> Result<deadpool_postgres::Client, deadpool_postgres::PoolError> {
        self.pool.get().await
    }
}
