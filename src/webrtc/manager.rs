//! Signaling session registry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{SessionInfo, SignalingSession};
use super::transport::TransportFactory;
use crate::config::WebRtcSettings;
use crate::error::{AppError, Result};
use crate::events::EventBus;
use crate::stream::ChannelRegistry;

/// How often terminal sessions are reaped
const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, Arc<SignalingSession>>,
    /// Most recently created session, for clients that do not send an id
    latest: Option<String>,
}

pub struct SessionManager {
    settings: WebRtcSettings,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<ChannelRegistry>,
    events: Arc<EventBus>,
    sessions: RwLock<Sessions>,
}

impl SessionManager {
    pub fn new(
        settings: WebRtcSettings,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<ChannelRegistry>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            factory,
            registry,
            events,
            sessions: RwLock::new(Sessions::default()),
        })
    }

    pub fn settings(&self) -> &WebRtcSettings {
        &self.settings
    }

    /// Create a session with a fresh transport.
    ///
    /// Fails with `ServiceUnavailable` once `max_sessions` live sessions exist.
    pub async fn create_session(&self) -> Result<Arc<SignalingSession>> {
        self.cleanup().await;

        if self.sessions.read().await.by_id.len() >= self.settings.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum sessions ({}) reached",
                self.settings.max_sessions
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let transport = self.factory.create(&session_id).await?;
        let session = SignalingSession::new(
            session_id.clone(),
            transport,
            self.registry.clone(),
            self.events.clone(),
            &self.settings,
        );

        let mut sessions = self.sessions.write().await;
        if sessions.by_id.len() >= self.settings.max_sessions {
            drop(sessions);
            session.close().await;
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum sessions ({}) reached",
                self.settings.max_sessions
            )));
        }
        sessions.by_id.insert(session_id.clone(), session.clone());
        sessions.latest = Some(session_id.clone());
        drop(sessions);

        info!(session_id = %session_id, "Signaling session created");
        Ok(session)
    }

    /// Look up a session by id, or the latest one when `id` is `None`.
    pub async fn get(&self, id: Option<&str>) -> Result<Arc<SignalingSession>> {
        let sessions = self.sessions.read().await;
        let id = match id {
            Some(id) => id,
            None => sessions
                .latest
                .as_deref()
                .ok_or_else(|| AppError::SessionNotFound("no session created yet".to_string()))?,
        };

        sessions
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    /// Close and forget a session
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .by_id
                .remove(id)
                .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;
            if sessions.latest.as_deref() == Some(id) {
                sessions.latest = None;
            }
            session
        };

        session.close().await;
        info!(session_id = %id, "Signaling session closed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions.by_id.values().map(|s| s.info()).collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.by_id.len()
    }

    /// Drop sessions that reached `Failed` or `Closed`
    pub async fn cleanup(&self) {
        let stale: Vec<Arc<SignalingSession>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .by_id
                .iter()
                .filter(|(_, s)| s.state().is_terminal())
                .map(|(id, _)| id.clone())
                .collect();

            let mut stale = Vec::with_capacity(ids.len());
            for id in ids {
                if sessions.latest.as_deref() == Some(id.as_str()) {
                    sessions.latest = None;
                }
                if let Some(session) = sessions.by_id.remove(&id) {
                    stale.push(session);
                }
            }
            stale
        };

        for session in stale {
            debug!(session_id = %session.id(), "Removing {} session", session.state());
            // Failed sessions still hold their last state; make it final
            session.close().await;
        }
    }

    /// Periodically reap terminal sessions until `shutdown` fires
    pub fn start_reaper(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.cleanup().await;
                    }
                }
            }
        });
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<SignalingSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.latest = None;
            sessions.by_id.drain().map(|(_, s)| s).collect()
        };

        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        if count > 0 {
            info!("Closed {} signaling sessions", count);
        }
    }
}
