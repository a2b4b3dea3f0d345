//! Construction of provider sessions by backend kind

use std::fmt;
use std::sync::Arc;

use crate::delegate::AgentQuery;
use crate::rpc::{RpcTransport, StdioTransport};
use crate::session::{
    DelegateSession, DelegateSessionConfig, EventEmitter, ProviderSession, RpcSession,
    RpcSessionConfig,
};
use crate::types::{BackendKind, HubConfig, Result};

/// Builds a session of the requested backend
///
/// The session emits onto `events`, a queue owned by the caller.
pub trait SessionFactory: Send + Sync + fmt::Debug {
    fn build(
        &self,
        id: &str,
        backend: BackendKind,
        events: EventEmitter,
    ) -> Result<Arc<dyn ProviderSession>>;
}

/// Production factory: app-server over stdio, or the SDK delegate
#[derive(Debug, Clone)]
pub struct BackendFactory {
    config: HubConfig,
    transport: Arc<dyn RpcTransport>,
    query: Arc<dyn AgentQuery>,
}

impl BackendFactory {
    pub fn new(config: HubConfig, query: Arc<dyn AgentQuery>) -> Self {
        let transport = Arc::new(StdioTransport::new(config.codex_path.clone()));
        Self {
            config,
            transport,
            query,
        }
    }

    /// Replace how RPC-variant sessions reach their app-server
    pub fn with_transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = transport;
        self
    }
}

impl SessionFactory for BackendFactory {
    fn build(
        &self,
        id: &str,
        backend: BackendKind,
        events: EventEmitter,
    ) -> Result<Arc<dyn ProviderSession>> {
        tracing::debug!(session_id = %id, backend = %backend, "Building provider session");
        Ok(match backend {
            BackendKind::Codex => Arc::new(RpcSession::with_emitter(
                id,
                self.transport.clone(),
                RpcSessionConfig::from(&self.config),
                events,
            )),
            BackendKind::Claude => Arc::new(DelegateSession::with_emitter(
                id,
                self.query.clone(),
                DelegateSessionConfig::from(&self.config),
                events,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::ClaudeQuery;
    use crate::session::event_channel;
    use crate::types::{ProviderEvent, SessionEvent, SessionStatus};

    #[test]
    fn test_builds_both_backends() {
        let factory = BackendFactory::new(HubConfig::default(), Arc::new(ClaudeQuery::new()));
        let (emitter, mut events) = event_channel();

        let rpc = factory.build("s-1", BackendKind::Codex, emitter.clone()).unwrap();
        assert_eq!(rpc.backend(), BackendKind::Codex);
        assert_eq!(rpc.id(), "s-1");
        assert!(!rpc.supports_rewind());

        let delegate = factory.build("s-2", BackendKind::Claude, emitter.clone()).unwrap();
        assert_eq!(delegate.backend(), BackendKind::Claude);
        assert_eq!(delegate.status(), SessionStatus::Starting);
        assert!(delegate.supports_rewind());

        // Nothing emitted before start; the queue belongs to the caller
        emitter.emit(ProviderEvent::error("marker"));
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::Message(ProviderEvent::Error(_)))
        ));
    }
}
