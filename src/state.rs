use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::stream::ChannelRegistry;
use crate::webrtc::{SessionManager, TransportFactory};

/// Application-wide state shared across handlers and ingest adapters
///
/// There is exactly one registry and one session manager per process; every
/// component receives them from here instead of reaching for globals.
pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<ChannelRegistry>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<EventBus>,
    /// Cancelled once on shutdown
    pub shutdown: CancellationToken,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, transports: Arc<dyn TransportFactory>) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let registry = ChannelRegistry::new(config.bus, events.clone());
        let sessions = SessionManager::new(
            config.webrtc.clone(),
            transports,
            registry.clone(),
            events.clone(),
        );

        Arc::new(Self {
            config,
            registry,
            sessions,
            events,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Close every session, then every channel
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.close_all().await;
        self.registry.close_all();
    }
}
