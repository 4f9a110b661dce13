use crate::config::AppConfig;
use crate::core::HistoryStore;

#[derive(Clone)]
pub struct AppContext {
    pub config: std::sync::Arc<AppConfig>,
    pub history: HistoryStore,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: std::sync::Arc::new(config),
            history: HistoryStore::new(),
        }
    }
}
