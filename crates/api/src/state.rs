//! Application state

use sqlx::PgPool;
use std::sync::Arc;
use tuition_billing::ReconciliationEngine;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub engine: Arc<ReconciliationEngine>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            pool,
            config,
            engine,
        }
    }
}
