// Application context: the explicitly constructed bundle every component
// receives: configuration, the store, and the store locks.

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::lock::StoreLocks;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub db: Arc<dyn Database>,
    pub locks: Arc<StoreLocks>,
}

impl AppContext {
    pub fn new(config: Config, db: Arc<dyn Database>) -> Self {
        Self {
            config: Arc::new(config),
            db,
            locks: Arc::new(StoreLocks::new()),
        }
    }
}
