use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::{DbConnection, DbPool},
    error::{AppError, AppResult},
    store::AttachmentStore,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<AppConfig>,
    pub store: Arc<AttachmentStore>,
}

impl AppState {
    pub fn new(pool: DbPool, config: AppConfig, store: AttachmentStore) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            store: Arc::new(store),
        }
    }

    pub fn db(&self) -> AppResult<DbConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
