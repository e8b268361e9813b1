//! # Router
//!
//! Binds named handlers to input topics and drives one consumption loop per
//! handler.
//!
//! ## Lifecycle
//! `Created → Configured → Running → Stopping → Stopped`. Handlers,
//! middleware and plugins are registered before `run`, which consumes the
//! router. Shutdown is cooperative: loops stop receiving once the token is
//! cancelled, finish the invocation in hand, and are aborted only after
//! `close_timeout`.

mod handler;
mod plugin;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::error::RouterError;
use crate::middleware::{compose, Middleware};
use crate::types::RouterConfig;

pub use handler::{
    handler_fn, typed_handler, HandlerFunc, HandlerFuture, HandlerRegistration, HandlerStats,
};
pub use plugin::{RouterPlugin, SignalsHandler};

use handler::HandlerLoop;

/// Router lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    Created,
    Configured,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RouterState::Created => "created",
            RouterState::Configured => "configured",
            RouterState::Running => "running",
            RouterState::Stopping => "stopping",
            RouterState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Handler pipeline driving one consumption loop per registered handler.
pub struct Router {
    config: RouterConfig,
    broker: Arc<dyn BrokerClient>,
    handlers: Vec<(HandlerRegistration, HandlerFunc)>,
    middleware: Vec<Arc<dyn Middleware>>,
    plugins: Vec<Arc<dyn RouterPlugin>>,
    state: watch::Sender<RouterState>,
    shutdown: CancellationToken,
}

impl Router {
    pub fn new(config: RouterConfig, broker: Arc<dyn BrokerClient>) -> Self {
        let (state, _) = watch::channel(RouterState::Created);
        Self {
            config,
            broker,
            handlers: Vec::new(),
            middleware: Vec::new(),
            plugins: Vec::new(),
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// `DuplicateHandler` if the name is taken, `Config` if the name, input
    /// topic or consumer group is empty.
    pub fn add_handler(
        &mut self,
        registration: HandlerRegistration,
        func: HandlerFunc,
    ) -> Result<&mut Self, RouterError> {
        if registration.name().is_empty() {
            return Err(RouterError::Config("handler name is empty".to_string()));
        }
        if registration.input_topic().is_empty() || registration.consumer_group().is_empty() {
            return Err(RouterError::Config(format!(
                "handler {} needs an input topic and a consumer group",
                registration.name()
            )));
        }
        if self
            .handlers
            .iter()
            .any(|(existing, _)| existing.name() == registration.name())
        {
            return Err(RouterError::DuplicateHandler(registration.name().to_string()));
        }

        info!(
            handler = %registration.name(),
            input = %registration.input_topic(),
            output = registration.output_topic().unwrap_or("-"),
            group = %registration.consumer_group(),
            "Handler registered"
        );
        self.handlers.push((registration, func));
        self.configured();
        Ok(self)
    }

    /// Add middleware applied to every handler. The first added is outermost.
    pub fn add_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self.configured();
        self
    }

    pub fn add_plugin(&mut self, plugin: impl RouterPlugin + 'static) -> &mut Self {
        self.plugins.push(Arc::new(plugin));
        self.configured();
        self
    }

    pub fn state(&self) -> RouterState {
        *self.state.borrow()
    }

    /// Receiver tracking every state transition.
    pub fn state_watch(&self) -> watch::Receiver<RouterState> {
        self.state.subscribe()
    }

    /// Token that stops the router when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|(registration, _)| registration.name()).collect()
    }

    fn configured(&self) {
        self.state.send_if_modified(|state| {
            if *state == RouterState::Created {
                *state = RouterState::Configured;
                true
            } else {
                false
            }
        });
    }

    fn transition(&self, next: RouterState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "Router state changed");
    }

    /// Run until `shutdown` or the router's own token is cancelled.
    ///
    /// # Errors
    ///
    /// `NoHandlers` when nothing is registered, `Startup` when a handler
    /// cannot subscribe, `HandlerPanicked` when a handler task died outside
    /// the guarded invocation. Failures of individual messages never end the
    /// run.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RouterError> {
        if self.handlers.is_empty() {
            return Err(RouterError::NoHandlers);
        }

        for plugin in &self.plugins {
            info!(plugin = plugin.name(), "Starting router plugin");
            plugin.on_start(self.shutdown.clone());
        }

        let mut loops = Vec::with_capacity(self.handlers.len());
        for (registration, func) in &self.handlers {
            let subscription = match self
                .broker
                .subscribe(registration.input_topic(), registration.consumer_group())
                .await
            {
                Ok(subscription) => subscription,
                Err(source) => {
                    error!(handler = %registration.name(), error = %source, "Handler failed to subscribe");
                    self.shutdown.cancel();
                    self.transition(RouterState::Stopped);
                    return Err(RouterError::Startup {
                        handler: registration.name().to_string(),
                        source,
                    });
                }
            };

            let chain = compose(registration.middleware(), Arc::clone(func));
            let chain = compose(&self.middleware, chain);

            loops.push(HandlerLoop {
                name: registration.name().to_string(),
                input_topic: registration.input_topic().to_string(),
                output_topic: registration.output_topic().map(str::to_string),
                func: chain,
                broker: Arc::clone(&self.broker),
                subscription,
                stats: HandlerStats::default(),
            });
        }

        self.transition(RouterState::Running);

        let mut tasks = JoinSet::new();
        for handler_loop in loops {
            tasks.spawn(handler_loop.run(self.shutdown.clone()));
        }

        let mut panicked = 0;
        let finished_early = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = self.shutdown.cancelled() => false,
            _ = drain(&mut tasks, &mut panicked) => true,
        };
        if finished_early {
            info!("All handlers stopped on their own");
        }

        self.shutdown.cancel();
        self.transition(RouterState::Stopping);

        let close_timeout = self.config.close_timeout();
        if tokio::time::timeout(close_timeout, drain(&mut tasks, &mut panicked))
            .await
            .is_err()
        {
            warn!(
                remaining = tasks.len(),
                timeout_ms = close_timeout.as_millis() as u64,
                "Handlers did not stop in time, aborting"
            );
            tasks.shutdown().await;
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker client");
        }

        self.transition(RouterState::Stopped);
        if panicked > 0 {
            return Err(RouterError::HandlerPanicked(panicked));
        }
        Ok(())
    }
}

/// Wait for every handler task, counting the ones that panicked.
async fn drain(tasks: &mut JoinSet<HandlerStats>, panicked: &mut usize) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "Handler task panicked");
                *panicked += 1;
            }
        }
    }
}
