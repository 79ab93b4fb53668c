pub mod bus;
pub mod chat;
pub mod config;
pub mod error;
pub mod notify;

use std::sync::Arc;

use tokio::task::JoinHandle;

use bus::connection::{ConnectionHandle, TopicConnection};
use bus::registry::SubscriptionRegistry;
use bus::supervisor::ReconnectSupervisor;
use bus::transport::Connector;
use chat::{ChatApi, ChatRoomSession};
use config::Config;
use error::Result;
use notify::NotificationAggregator;

/// Everything that lives for one authenticated session.
///
/// Created by [`login`](Self::login); dropping it (or calling
/// [`logout`](Self::logout)) deregisters every topic, stops the supervisor
/// and closes the connection.
pub struct RealtimeSession {
    pub config: Arc<Config>,
    pub handle: ConnectionHandle,
    pub connection: Arc<TopicConnection>,
    pub registry: Arc<SubscriptionRegistry>,
    pub aggregator: Arc<NotificationAggregator>,
    pub supervisor: Arc<ReconnectSupervisor>,
    pub chat: Arc<ChatRoomSession>,
    supervisor_task: JoinHandle<()>,
}

impl RealtimeSession {
    /// Connect with the configured token, attach the badge counters and start
    /// the reconnect supervisor.
    pub async fn login(
        config: Config,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self> {
        let connection =
            TopicConnection::new(connector, config.connect_timeout, config.receipt_timeout);
        let handle = connection.connect(&config.auth_token).await?;

        let registry = Arc::new(SubscriptionRegistry::new(connection.clone()));
        let aggregator = NotificationAggregator::new(connection.clone());
        aggregator.attach(&registry, config.user_id)?;

        let supervisor = ReconnectSupervisor::new(registry.clone(), config.backoff);
        let supervisor_task = supervisor.spawn();
        let chat = ChatRoomSession::new(config.user_id, registry.clone(), api);

        tracing::info!(user_id = config.user_id, session_id = %handle.session_id, "logged in");

        Ok(Self {
            config: Arc::new(config),
            handle,
            connection,
            registry,
            aggregator,
            supervisor,
            chat,
            supervisor_task,
        })
    }

    pub fn logout(self) {
        tracing::info!(user_id = self.config.user_id, "logging out");
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.supervisor_task.abort();
        let removed = self.registry.deregister_all();
        self.connection.disconnect();
        self.aggregator.reset();
        tracing::debug!(removed, "session torn down");
    }
}
