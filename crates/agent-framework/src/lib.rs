//! # Agent Framework
//!
//! The domain-free coordination substrate for long-running, supervised services that
//! talk to each other only through a topic bus.
//!
//! ## Building blocks
//!
//! 1. **Event Bus** ([`EventBus`]) - in-memory, topic-addressed fan-out with no
//!    store-and-forward. Each topic carries one statically typed [`Message`] enum.
//! 2. **Service Contract** ([`Service`], [`Lifecycle`]) - the shape every long-running
//!    component has: `run`, `request_stop`, `current_state`, plus a dependency gate
//!    that holds a service back until the services it needs report `Normal`.
//! 3. **Supervision Tree** ([`Supervisor`]) - starts services, restarts them when they
//!    return, backs off when they fail too often, and cascades stops. Supervisors are
//!    services too, so they nest.
//!
//! ## Communication model
//!
//! Services never call each other. A producer publishes on the bus; whoever joined that
//! topic receives it; nobody else ever will. Restarts are therefore independent: a
//! restarted consumer simply misses what was published while it was down.
//!
//! ```text
//! ┌────────────┐  publish   ┌──────────┐   join/recv   ┌──────────────┐
//! │  Producer  │──────────▶│ EventBus │──────────────▶│  Consumer(s) │
//! └────────────┘            └──────────┘               └──────────────┘
//!        ▲                                                     ▲
//!        └──────────── Supervisor (run / restart / stop) ──────┘
//! ```
//!
//! ## Errors
//!
//! [`FrameworkError`] covers dependency-gate timeouts, stops during start-up and invalid
//! registrations. The bus has no error type: publishing cannot fail.

pub mod bus;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod policy;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod tracing;

pub use bus::{EventBus, Message, Subscription};
pub use error::FrameworkError;
pub use lifecycle::Lifecycle;
pub use policy::{FailurePolicy, RestartDecision};
pub use registry::ServiceRegistry;
pub use service::{Service, ServiceState};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorSpec};
