//! Shared bundle handed to every consumer constructor.

use std::fmt;
use std::sync::Arc;

use crate::channel::ChannelRegistry;
use crate::config::RealtimeConfig;
use crate::error::Result;
use crate::http::{HttpApiClient, PresenceApi, QuietHoursApi};
use crate::reconnect::ReconnectPolicies;
use crate::session::SessionContext;
use crate::signals::LifecycleSignals;
use crate::timeouts::RealtimeTimeouts;
use crate::transport::{RealtimeTransport, WebSocketTransport};

/// Everything consumers share: one channel registry over the single
/// transport, the session, the external signals, timeouts, reconnect
/// policies and the HTTP collaborators. Cheap to clone.
#[derive(Clone)]
pub struct RealtimeContext {
    registry: ChannelRegistry,
    session: SessionContext,
    signals: LifecycleSignals,
    timeouts: RealtimeTimeouts,
    policies: ReconnectPolicies,
    presence_api: Option<Arc<dyn PresenceApi>>,
    quiet_hours_api: Option<Arc<dyn QuietHoursApi>>,
}

impl fmt::Debug for RealtimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeContext")
            .field("registry", &self.registry)
            .field("session", &self.session.snapshot())
            .field("presence_api", &self.presence_api.is_some())
            .field("quiet_hours_api", &self.quiet_hours_api.is_some())
            .finish()
    }
}

impl RealtimeContext {
    pub fn builder(transport: Arc<dyn RealtimeTransport>) -> RealtimeContextBuilder {
        RealtimeContextBuilder::new(transport)
    }

    /// Context over the process-wide WebSocket transport, with the HTTP
    /// collaborators enabled when `http.base_url` is set.
    pub fn from_config(config: &RealtimeConfig) -> Result<Self> {
        let transport = WebSocketTransport::shared(&config.transport, &config.timeouts)?;
        let mut builder = Self::builder(transport)
            .timeouts(config.timeouts.clone())
            .policies(config.reconnect.clone());

        if config.http.base_url.is_some() {
            let mut http = HttpApiClient::builder()
                .timeout(config.timeouts.http_timeout)
                .credentials(config.http.credentials());
            if let Some(base_url) = &config.http.base_url {
                http = http.base_url(base_url.clone());
            }
            builder = builder.http_client(http.build()?);
        }
        Ok(builder.build())
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn signals(&self) -> &LifecycleSignals {
        &self.signals
    }

    pub fn timeouts(&self) -> &RealtimeTimeouts {
        &self.timeouts
    }

    pub fn policies(&self) -> &ReconnectPolicies {
        &self.policies
    }

    pub fn presence_api(&self) -> Option<Arc<dyn PresenceApi>> {
        self.presence_api.clone()
    }

    pub fn quiet_hours_api(&self) -> Option<Arc<dyn QuietHoursApi>> {
        self.quiet_hours_api.clone()
    }
}

pub struct RealtimeContextBuilder {
    transport: Arc<dyn RealtimeTransport>,
    session: SessionContext,
    signals: LifecycleSignals,
    timeouts: RealtimeTimeouts,
    policies: ReconnectPolicies,
    presence_api: Option<Arc<dyn PresenceApi>>,
    quiet_hours_api: Option<Arc<dyn QuietHoursApi>>,
}

impl RealtimeContextBuilder {
    fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            session: SessionContext::new(),
            signals: LifecycleSignals::new(),
            timeouts: RealtimeTimeouts::default(),
            policies: ReconnectPolicies::default(),
            presence_api: None,
            quiet_hours_api: None,
        }
    }

    pub fn session(mut self, session: SessionContext) -> Self {
        self.session = session;
        self
    }

    pub fn signals(mut self, signals: LifecycleSignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn timeouts(mut self, timeouts: RealtimeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn policies(mut self, policies: ReconnectPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn presence_api(mut self, api: Arc<dyn PresenceApi>) -> Self {
        self.presence_api = Some(api);
        self
    }

    pub fn quiet_hours_api(mut self, api: Arc<dyn QuietHoursApi>) -> Self {
        self.quiet_hours_api = Some(api);
        self
    }

    /// Use one HTTP client for both collaborators.
    pub fn http_client(self, client: HttpApiClient) -> Self {
        let client = Arc::new(client);
        self.presence_api(client.clone()).quiet_hours_api(client)
    }

    pub fn build(self) -> RealtimeContext {
        RealtimeContext {
            registry: ChannelRegistry::new(self.transport),
            session: self.session,
            signals: self.signals,
            timeouts: self.timeouts,
            policies: self.policies,
            presence_api: self.presence_api,
            quiet_hours_api: self.quiet_hours_api,
        }
    }
}
