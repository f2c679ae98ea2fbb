use std::sync::Arc;

use lg_domain::config::Config;
use lg_pool::Pool;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<Pool>,
}
