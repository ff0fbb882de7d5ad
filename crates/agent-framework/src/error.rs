//! # Framework Errors
//!
//! Common error types for the service substrate. Bus operations have no error
//! type at all: publishing cannot fail by construction.

use std::time::Duration;

/// Errors raised by lifecycle helpers and supervisors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameworkError {
    /// One or more dependencies did not reach `Normal` before the gate timed out.
    #[error("service {service} timed out after {timeout:?} waiting for {pending:?}")]
    DependencyTimeout {
        service: String,
        pending: Vec<String>,
        timeout: Duration,
    },
    /// A stop was requested while the service was still starting up.
    #[error("service {0} was asked to stop during start-up")]
    StopRequested(String),
    #[error("service {0} cannot depend on itself")]
    SelfDependency(String),
    /// Registering the service would close a dependency cycle.
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("a service named {0} is already registered")]
    DuplicateService(String),
    #[error("no service named {0}")]
    UnknownService(String),
}
