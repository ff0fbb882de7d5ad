//! # Configuration Coordinator
//!
//! Loads the three configuration documents, then keeps them current: every change on
//! disk to one of the known files reloads that document alone and announces it on the
//! document's topic. Files the agent does not know about are ignored.
//!
//! A failing watch leaves the service `Paused` and ends `run()`; the supervisor's
//! restart re-establishes the watch and reloads everything.

use crate::config_store::{ConfigPaths, ConfigStore};
use crate::messages::{AgentBus, ConfigChange};
use crate::watcher::{ChangeEvent, ConfigWatcher};
use agent_framework::{Lifecycle, Service, ServiceState};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, trace, warn};

pub struct ConfigService {
    lifecycle: Lifecycle,
    store: ConfigStore,
    bus: AgentBus,
    paths: ConfigPaths,
    watcher: Arc<dyn ConfigWatcher>,
}

impl ConfigService {
    pub fn new(
        lifecycle: Lifecycle,
        store: ConfigStore,
        bus: AgentBus,
        paths: ConfigPaths,
        watcher: Arc<dyn ConfigWatcher>,
    ) -> Self {
        Self {
            lifecycle,
            store,
            bus,
            paths,
            watcher,
        }
    }

    async fn apply(&self, event: ChangeEvent) {
        let Some(document) = self.paths.document_for(&event.path) else {
            trace!(path = %event.path.display(), "Ignoring change to unrelated file");
            return;
        };
        info!(%document, path = %event.path.display(), kind = %event.kind, "Configuration change detected");

        let path = self.paths.path(document);
        if let Err(e) = self.store.load(document, path).await {
            warn!(%document, error = %e, "Reload failed; keeping previous configuration");
        }
        self.bus.publish(document.change_message(ConfigChange {
            path: event.path,
            kind: event.kind,
        }));
    }
}

#[async_trait]
impl Service for ConfigService {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&mut self) {
        if self.lifecycle.startup().await.is_err() {
            return;
        }

        let mut streams = match self.watcher.watch(&self.paths.dir).await {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, "Cannot watch configuration directory");
                self.lifecycle.set_state(ServiceState::Paused);
                return;
            }
        };

        self.store.load_all(&self.paths).await;
        self.lifecycle.set_state(ServiceState::Normal);

        loop {
            tokio::select! {
                _ = self.lifecycle.stopped() => {
                    self.lifecycle.set_state(ServiceState::NotRunning);
                    return;
                }
                event = streams.events.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => {
                        warn!("Configuration watch ended");
                        self.lifecycle.set_state(ServiceState::Paused);
                        return;
                    }
                },
                Some(error) = streams.errors.recv() => {
                    warn!(error = %error, "Configuration watch failed");
                    self.lifecycle.set_state(ServiceState::Paused);
                    return;
                }
            }
        }
    }
}
