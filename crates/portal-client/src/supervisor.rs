//! Tunnel supervisor
//!
//! Runs one [`TunnelSession`] per configured service. The first session
//! error cancels every other session; the supervisor waits for all of them
//! to drain and then returns that error. Errors reported after an external
//! shutdown are logged and ignored.

use portal_transport::RelayConnector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, TunnelConfig};
use crate::directory::RelayDirectory;
use crate::error::TunnelError;
use crate::session::TunnelSession;

pub struct TunnelSupervisor<C: RelayConnector> {
    directory: Arc<RelayDirectory>,
    services: Vec<ServiceConfig>,
    connector: Arc<C>,
    origin: Option<String>,
}

impl<C: RelayConnector> TunnelSupervisor<C> {
    pub fn new(
        directory: Arc<RelayDirectory>,
        services: Vec<ServiceConfig>,
        connector: Arc<C>,
    ) -> Self {
        Self {
            directory,
            services,
            connector,
            origin: None,
        }
    }

    pub fn from_config(config: &TunnelConfig, connector: Arc<C>) -> Self {
        Self::new(
            Arc::new(config.directory()),
            config.services.clone(),
            connector,
        )
    }

    /// Origin label passed on to every session
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }

    fn session(&self, service: ServiceConfig) -> TunnelSession<C> {
        let session = TunnelSession::new(service, self.directory.clone(), self.connector.clone());
        match &self.origin {
            Some(origin) => session.with_origin(origin.clone()),
            None => session,
        }
    }

    /// Run every session until `shutdown` fires or one of them fails
    ///
    /// Dropping the returned future cancels every session; they drain in
    /// the background.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let mut sessions = SessionSet::new(shutdown.child_token());

        for service in &self.services {
            sessions.spawn(service.label(), self.session(service.clone()));
        }

        info!(sessions = sessions.tasks.len(), "Tunnel sessions started");

        let mut first_error: Option<TunnelError> = None;
        while let Some(result) = sessions.join_next().await {
            let Err(err) = result else {
                continue;
            };

            if first_error.is_some() {
                debug!(service = %err.service(), "Session failed while draining: {}", err);
            } else if shutdown.is_cancelled() {
                warn!(service = %err.service(), "Session failed during shutdown: {}", err);
            } else {
                error!(service = %err.service(), "Session failed: {}", err);
                first_error = Some(err);
                sessions.scope.cancel();
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Running sessions sharing one cancellation scope
struct SessionSet {
    tasks: JoinSet<Result<(), TunnelError>>,
    labels: HashMap<Id, String>,
    scope: CancellationToken,
}

impl SessionSet {
    fn new(scope: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            labels: HashMap::new(),
            scope,
        }
    }

    fn spawn<C: RelayConnector>(&mut self, label: String, session: TunnelSession<C>) {
        let token = self.scope.child_token();
        let handle = self
            .tasks
            .spawn(async move { session.run(token).await });
        self.labels.insert(handle.id(), label);
    }

    /// Next finished session; a panic is reported against its service
    async fn join_next(&mut self) -> Option<Result<(), TunnelError>> {
        loop {
            match self.tasks.join_next_with_id().await? {
                Ok((id, result)) => {
                    self.labels.remove(&id);
                    return Some(result);
                }
                Err(e) => {
                    let service = self.labels.remove(&e.id()).unwrap_or_default();
                    if !e.is_panic() {
                        debug!(service = %service, "Session task cancelled");
                        continue;
                    }
                    error!(service = %service, "Session task panicked: {}", e);
                    return Some(Err(TunnelError::SessionPanicked { service }));
                }
            }
        }
    }
}

impl Drop for SessionSet {
    fn drop(&mut self) {
        // Sessions still running see the cancelled scope and drain on their own
        self.scope.cancel();
        self.tasks.detach_all();
    }
}
