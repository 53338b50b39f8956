//! Handler for `subwire`
//!
//! The engine object, constructed once per process. It owns the collaborators,
//! the configuration and the session registry, and opens one [`Session`] per
//! transport connection.

use std::sync::Arc;
use std::time::Instant;

use super::broadcast::{BroadcastReport, SessionRegistry};
use super::gateway::{Collaborators, ConnectionInfo};
use super::outbound::Outbound;
use super::session::Session;
use super::wire::ReconnectNotification;
use crate::Config;

pub struct Handler<C> {
    config: Config,
    services: Collaborators<C>,
    registry: Arc<SessionRegistry>,
    start_time: Instant,
}

impl<C: Send + Sync + 'static> Handler<C> {
    pub fn new(config: Config, services: Collaborators<C>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.session.max_backpressure,
            config.session.close_on_backpressure_limit,
        ));
        Self {
            config,
            services,
            registry,
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a session for a freshly accepted connection.
    ///
    /// `outbound` is the connection's write queue; the caller drains its
    /// receiving half onto the transport.
    pub fn connect(&self, info: ConnectionInfo, outbound: Outbound) -> Arc<Session<C>> {
        Session::start(
            info,
            outbound,
            self.services.clone(),
            self.config.session.clone(),
            Arc::clone(&self.registry),
        )
    }

    /// Ask every connected client to reconnect.
    pub fn broadcast_reconnect_notification(&self) -> BroadcastReport {
        self.registry.publish(&ReconnectNotification)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    /// Get uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
