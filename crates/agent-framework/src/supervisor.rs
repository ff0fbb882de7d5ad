//! # Supervision Tree
//!
//! A [`Supervisor`] owns a set of services, runs each in its own task, and restarts any
//! that return from `run()` without having been asked to stop.
//!
//! ## Restart policy
//!
//! Restarts follow [`FailurePolicy`]: immediate while the decayed failure count stays at
//! or below `failure_threshold`, otherwise a `failure_backoff` pause first. A restart
//! re-invokes the same service value, so it keeps any state it chose to retain.
//!
//! ## Nesting
//!
//! `Supervisor` implements [`Service`], so it can be added to another supervisor:
//!
//! ```text
//! master
//! ├── Config
//! ├── Integrations   (depends on Config)
//! ├── State          (depends on Integrations)
//! └── FieldbusSupervisor
//!     └── Modbus     (depends on Config)
//! ```
//!
//! Stopping a supervisor cascades a stop request to every owned service and waits up
//! to `shutdown_timeout` for them to return. Services that overrun are logged and left
//! detached; they are never killed.
//!
//! ## Handles
//!
//! [`serve`](Supervisor::serve) takes `&mut self`, so once a supervisor runs in its own
//! task use a [`SupervisorHandle`] to add, remove or stop services.

use crate::error::FrameworkError;
use crate::lifecycle::Lifecycle;
use crate::policy::{FailurePolicy, RestartDecision};
use crate::registry::ServiceRegistry;
use crate::service::{Service, ServiceState};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Tuning for a supervisor's restart policy and shutdown.
#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    pub failure_threshold: f64,
    /// Half-life of the failure count.
    pub failure_decay: Duration,
    pub failure_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorSpec {
    fn default() -> Self {
        Self {
            failure_threshold: 3.0,
            failure_decay: Duration::from_secs(30),
            failure_backoff: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl SupervisorSpec {
    fn policy(&self) -> FailurePolicy {
        FailurePolicy::new(
            self.failure_threshold,
            self.failure_decay,
            self.failure_backoff,
        )
    }
}

enum Command {
    Add(Box<dyn Service>),
    Remove(String),
}

struct Child {
    lifecycle: Lifecycle,
    task: JoinHandle<()>,
}

/// Cloneable control surface for a [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    lifecycle: Lifecycle,
    commands: mpsc::UnboundedSender<Command>,
    members: Arc<Mutex<BTreeSet<String>>>,
}

impl SupervisorHandle {
    /// Registers `service` and schedules it to start. Rejects duplicate names and
    /// registrations that would close a dependency cycle.
    pub fn add(&self, service: Box<dyn Service>) -> Result<(), FrameworkError> {
        let lifecycle = service.lifecycle().clone();
        let name = lifecycle.name().to_string();
        lifecycle.registry().register(
            &name,
            lifecycle.dependencies(),
            lifecycle.subscribe_state(),
        )?;
        self.members.lock().insert(name.clone());
        info!(supervisor = %self.lifecycle.name(), service = %name, "Service added");
        if self.commands.send(Command::Add(service)).is_err() {
            warn!(supervisor = %self.lifecycle.name(), service = %name, "Supervisor gone; service will not start");
        }
        Ok(())
    }

    /// Stops `name` and stops restarting it.
    pub fn remove(&self, name: &str) -> Result<(), FrameworkError> {
        if !self.members.lock().remove(name) {
            return Err(FrameworkError::UnknownService(name.to_string()));
        }
        self.lifecycle.registry().unregister(name);
        info!(supervisor = %self.lifecycle.name(), service = %name, "Service removed");
        let _ = self.commands.send(Command::Remove(name.to_string()));
        Ok(())
    }

    /// Requests a stop and waits until the supervisor has drained its services.
    pub async fn stop(&self) {
        self.lifecycle.request_stop();
        let mut state = self.lifecycle.subscribe_state();
        let _ = state.wait_for(|s| !s.is_normal()).await;
    }

    /// Names of the services this supervisor owns, sorted.
    pub fn services(&self) -> Vec<String> {
        self.members.lock().iter().cloned().collect()
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

pub struct Supervisor {
    lifecycle: Lifecycle,
    spec: SupervisorSpec,
    handle: SupervisorHandle,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, spec: SupervisorSpec, registry: ServiceRegistry) -> Self {
        let lifecycle = Lifecycle::builder(name).build(registry);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle {
            lifecycle: lifecycle.clone(),
            commands: tx,
            members: Arc::new(Mutex::new(BTreeSet::new())),
        };
        Self {
            lifecycle,
            spec,
            handle,
            commands: rx,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn add(&self, service: Box<dyn Service>) -> Result<(), FrameworkError> {
        self.handle.add(service)
    }

    pub fn remove(&self, name: &str) -> Result<(), FrameworkError> {
        self.handle.remove(name)
    }

    pub async fn stop(&self) {
        self.handle.stop().await
    }

    /// Runs every added service until the supervisor is stopped.
    pub async fn serve(&mut self) {
        let name = self.lifecycle.name().to_string();
        if self.lifecycle.is_stop_requested() {
            debug!(supervisor = %name, "Stopped before serving");
            return;
        }

        self.lifecycle.set_state(ServiceState::Normal);
        let mut children: HashMap<String, Child> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = self.lifecycle.stopped() => break,
                Some(command) = self.commands.recv() => match command {
                    Command::Add(service) => {
                        let lifecycle = service.lifecycle().clone();
                        let task = tokio::spawn(supervise(service, self.spec.clone(), name.clone()));
                        children.insert(lifecycle.name().to_string(), Child { lifecycle, task });
                    }
                    Command::Remove(service) => {
                        if let Some(child) = children.remove(&service) {
                            child.lifecycle.request_stop();
                        }
                    }
                },
            }
        }

        // Services queued but never started.
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Add(service) = command {
                service.request_stop();
            }
        }

        self.drain(children).await;
        self.lifecycle.set_state(ServiceState::NotRunning);
        info!(supervisor = %name, "Supervisor stopped");
    }

    async fn drain(&self, children: HashMap<String, Child>) {
        for child in children.values() {
            child.lifecycle.request_stop();
        }

        let deadline = Instant::now() + self.spec.shutdown_timeout;
        for (service, child) in children {
            if tokio::time::timeout_at(deadline, child.task).await.is_err() {
                warn!(
                    supervisor = %self.lifecycle.name(),
                    service = %service,
                    timeout = ?self.spec.shutdown_timeout,
                    "Service did not stop in time; detaching"
                );
            }
        }
    }
}

#[async_trait]
impl Service for Supervisor {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&mut self) {
        self.serve().await
    }
}

/// Restart loop for one service.
async fn supervise(mut service: Box<dyn Service>, spec: SupervisorSpec, supervisor: String) {
    let lifecycle = service.lifecycle().clone();
    let name = lifecycle.name().to_string();
    let mut policy = spec.policy();

    while !lifecycle.is_stop_requested() {
        debug!(supervisor = %supervisor, detail = %lifecycle.detail(), "Starting service");

        // A panic counts as one more failure; the same value is run again.
        if let Err(panic) = AssertUnwindSafe(service.run()).catch_unwind().await {
            error!(
                supervisor = %supervisor,
                service = %name,
                panic = %panic_message(panic.as_ref()),
                "Service panicked"
            );
        }

        if lifecycle.state().is_normal() {
            lifecycle.set_state(ServiceState::NotRunning);
        }
        if lifecycle.is_stop_requested() {
            break;
        }

        match policy.record_failure(Instant::now()) {
            RestartDecision::Immediate => {
                warn!(supervisor = %supervisor, service = %name, failures = policy.failures(), "Service exited; restarting");
            }
            RestartDecision::Backoff(pause) => {
                warn!(supervisor = %supervisor, service = %name, backoff = ?pause, "Service failing repeatedly; backing off");
                tokio::select! {
                    _ = lifecycle.stopped() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    lifecycle.set_state(ServiceState::NotRunning);
    info!(supervisor = %supervisor, service = %name, "Service stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
