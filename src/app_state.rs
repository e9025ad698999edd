use std::sync::Arc;

use crate::aggregate::aggregator::Aggregator;
use crate::config::Config;

/// Shared per-request state: one `Arc<AppState>` is cloned per connection
/// instead of a handful of individual `Arc`s.
pub struct AppState {
    pub config: Config,
    pub aggregator: Arc<Aggregator>,
}
