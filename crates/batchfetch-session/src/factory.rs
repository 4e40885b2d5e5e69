//! Session factory owning configuration and shared statistics.

use crate::stats::Statistics;
use crate::{Session, SessionConfig};
use batchfetch_core::Connection;
use std::sync::Arc;

/// Opens sessions that share one configuration and one [`Statistics`].
///
/// ```ignore
/// let factory = SessionFactory::new(SessionConfig::default().with_statistics(true));
/// let mut session = factory.open_session(conn);
/// // ...
/// assert_eq!(factory.statistics().prepare_count(), 2);
/// ```
#[derive(Debug)]
pub struct SessionFactory {
    config: SessionConfig,
    statistics: Arc<Statistics>,
}

impl SessionFactory {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let statistics = Arc::new(Statistics::new(config.generate_statistics));
        Self { config, statistics }
    }

    /// Open a session over `connection`.
    pub fn open_session<C: Connection>(&self, connection: C) -> Session<C> {
        Session::with_statistics(connection, self.config.clone(), Arc::clone(&self.statistics))
    }

    /// Counters shared by every session of this factory.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Default for SessionFactory {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
