//! # Lifecycle Helper
//!
//! The reusable piece every service owns: identity, declared dependencies, start delay,
//! current state, stop signal, and the dependency gate.
//!
//! A [`Lifecycle`] is a cheap handle (`Arc` inside). The supervisor keeps a clone so it
//! can read state and request a stop while the service body is running elsewhere.
//!
//! ## Start-up sequence
//!
//! A typical `run()` starts with [`Lifecycle::startup`]:
//!
//! 1. sleep for the start delay,
//! 2. wait for every dependency to report `Normal` (bounded by the dependency timeout),
//! 3. return `Ok` so the body can mark itself `Normal` and enter its loop.
//!
//! Both waits end early if a stop is requested. Any `Err` means: return from `run()` now.
//!
//! ```rust
//! use agent_framework::lifecycle::Lifecycle;
//! use agent_framework::registry::ServiceRegistry;
//! use agent_framework::service::ServiceState;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = ServiceRegistry::new();
//!     let lifecycle = Lifecycle::builder("Integrations")
//!         .depends_on("Config")
//!         .dependency_timeout(Duration::from_millis(10))
//!         .build(registry);
//!
//!     // Config was never registered, so the gate times out.
//!     assert!(lifecycle.startup().await.is_err());
//!     assert_eq!(lifecycle.state(), ServiceState::NotRunning);
//! }
//! ```

use crate::error::FrameworkError;
use crate::registry::ServiceRegistry;
use crate::service::ServiceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on the dependency gate.
pub const DEFAULT_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the gate re-checks for a dependency that has not registered yet.
const REGISTRY_POLL: Duration = Duration::from_millis(50);

pub struct LifecycleBuilder {
    name: String,
    dependencies: Vec<String>,
    start_delay: Duration,
    dependency_timeout: Duration,
}

impl LifecycleBuilder {
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    pub fn build(self, registry: ServiceRegistry) -> Lifecycle {
        let (state, _) = watch::channel(ServiceState::NotRunning);
        Lifecycle {
            inner: Arc::new(Inner {
                name: self.name,
                dependencies: self.dependencies,
                start_delay: self.start_delay,
                dependency_timeout: self.dependency_timeout,
                state,
                stop: CancellationToken::new(),
                registry,
            }),
        }
    }
}

struct Inner {
    name: String,
    dependencies: Vec<String>,
    start_delay: Duration,
    dependency_timeout: Duration,
    state: watch::Sender<ServiceState>,
    stop: CancellationToken,
    registry: ServiceRegistry,
}

#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn builder(name: impl Into<String>) -> LifecycleBuilder {
        LifecycleBuilder {
            name: name.into(),
            dependencies: Vec::new(),
            start_delay: Duration::ZERO,
            dependency_timeout: DEFAULT_DEPENDENCY_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.inner.dependencies
    }

    pub fn start_delay(&self) -> Duration {
        self.inner.start_delay
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    pub fn set_state(&self, state: ServiceState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(service = %self.inner.name, from = %previous, to = %state, "State changed");
        }
    }

    /// A receiver that observes every state change of this service.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    pub fn request_stop(&self) {
        if !self.inner.stop.is_cancelled() {
            debug!(service = %self.inner.name, "Stop requested");
            self.inner.stop.cancel();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Resolves once a stop has been requested. Cancel-safe.
    pub async fn stopped(&self) {
        self.inner.stop.cancelled().await
    }

    /// Start delay followed by the dependency gate, both interruptible by a stop request.
    pub async fn startup(&self) -> Result<(), FrameworkError> {
        if !self.inner.start_delay.is_zero() {
            tokio::select! {
                _ = self.stopped() => {
                    return Err(FrameworkError::StopRequested(self.inner.name.clone()));
                }
                _ = tokio::time::sleep(self.inner.start_delay) => {}
            }
        }
        self.wait_for_dependencies(self.inner.dependency_timeout)
            .await
    }

    /// Blocks until every declared dependency reports `Normal`, or `timeout` elapses.
    pub async fn wait_for_dependencies(&self, timeout: Duration) -> Result<(), FrameworkError> {
        if self.inner.dependencies.is_empty() {
            return Ok(());
        }

        tokio::select! {
            _ = self.stopped() => Err(FrameworkError::StopRequested(self.inner.name.clone())),
            gate = tokio::time::timeout(timeout, self.all_dependencies_normal()) => match gate {
                Ok(()) => {
                    debug!(service = %self.inner.name, "Dependencies satisfied");
                    Ok(())
                }
                Err(_) => {
                    let pending = self.pending_dependencies();
                    warn!(service = %self.inner.name, ?pending, ?timeout, "Dependency wait timed out");
                    Err(FrameworkError::DependencyTimeout {
                        service: self.inner.name.clone(),
                        pending,
                        timeout,
                    })
                }
            },
        }
    }

    /// Names of declared dependencies that are not `Normal` right now.
    pub fn pending_dependencies(&self) -> Vec<String> {
        self.inner
            .dependencies
            .iter()
            .filter(|dep| !self.inner.registry.state(dep).is_normal())
            .cloned()
            .collect()
    }

    /// Human-readable summary, e.g. `Service: Modbus [Status: Normal, Dependent Upon: (Config)]`.
    pub fn detail(&self) -> String {
        format!(
            "Service: {} [Status: {}, Dependent Upon: ({})]",
            self.inner.name,
            self.state(),
            self.inner.dependencies.join(", ")
        )
    }

    async fn all_dependencies_normal(&self) {
        loop {
            for dep in &self.inner.dependencies {
                self.dependency_normal(dep).await;
            }
            // A dependency may have dropped out while we waited on a later one.
            if self.pending_dependencies().is_empty() {
                return;
            }
        }
    }

    async fn dependency_normal(&self, dep: &str) {
        loop {
            if let Some(mut state) = self.inner.registry.watch(dep) {
                if state.wait_for(|s| s.is_normal()).await.is_ok() {
                    return;
                }
            }
            tokio::time::sleep(REGISTRY_POLL).await;
        }
    }
}
