use std::sync::Arc;
use std::time::Instant;

use prometheus::Registry;

use crate::config::Settings;
use crate::notification::{Enqueuer, Manager};
use crate::postgres::PostgresPool;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub manager: Arc<Manager>,
    pub enqueuer: Arc<dyn Enqueuer>,
    pub registry: Arc<Registry>,
    pub postgres_pool: Option<Arc<PostgresPool>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        manager: Arc<Manager>,
        enqueuer: Arc<dyn Enqueuer>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            manager,
            enqueuer,
            registry,
            postgres_pool: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_postgres_pool(mut self, pool: Option<Arc<PostgresPool>>) -> Self {
        self.postgres_pool = pool;
        self
    }
}
