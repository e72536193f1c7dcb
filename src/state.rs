use std::sync::Arc;

use dashmap::DashMap;
use sqlx::{Pool, Postgres};
use tokio::task::AbortHandle;

use crate::broadcast::TotalsBroadcast;
use crate::config::AppConfig;
use crate::lifecycle::MatchLifecycle;
use crate::stakes::StakeBook;

/// Explicitly constructed components, wired once at startup and handed to
/// handlers by cloning. Nothing here is a lazy global.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    pub(crate) broadcast: Arc<TotalsBroadcast>,
    pub(crate) stakes: Arc<StakeBook>,
    pub(crate) lifecycle: Arc<MatchLifecycle>,
    pub(crate) finalize_timers: Arc<DashMap<String, AbortHandle>>,
}
