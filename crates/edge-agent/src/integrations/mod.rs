//! # Outbound Integrations
//!
//! An [`Integration`] is one sink: a live connection to an IIoT back-end that accepts
//! health records and sample sets. The multiplexer creates one per connection record,
//! picking the implementation by the record's `provider` through an
//! [`IntegrationRegistry`].
//!
//! Adding a provider means registering a factory, not editing the multiplexer:
//!
//! ```rust,ignore
//! let mut registry = IntegrationRegistry::with_defaults();
//! registry.register("MyBackend", Arc::new(|ctx| Box::new(MyBackend::new(ctx))));
//! ```

pub mod generic_mqtt;
pub mod initial_state;

use crate::config_store::ConfigStore;
use crate::error::IntegrationError;
use crate::model::connectivity::provider;
use crate::model::{ConnectionRecord, HealthRecord, SampleSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use generic_mqtt::GenericMqtt;
pub use initial_state::InitialState;

#[async_trait]
pub trait Integration: Send {
    fn set_connection_record(&mut self, record: ConnectionRecord);

    fn connection_record(&self) -> &ConnectionRecord;

    async fn connect(&mut self) -> Result<(), IntegrationError>;

    async fn close(&mut self) -> Result<(), IntegrationError>;

    async fn send_state(&mut self, record: &HealthRecord) -> Result<(), IntegrationError>;

    async fn send_data(&mut self, samples: &SampleSet) -> Result<(), IntegrationError>;

    /// Inbound command payloads. Nothing delivers these yet.
    async fn receive_data(&mut self, _payload: &[u8]) -> Result<(), IntegrationError> {
        Ok(())
    }
}

/// What a factory may draw on when building a sink.
#[derive(Clone)]
pub struct IntegrationContext {
    pub store: ConfigStore,
    pub request_timeout: Duration,
}

pub type IntegrationFactory =
    Arc<dyn Fn(&IntegrationContext) -> Box<dyn Integration> + Send + Sync>;

/// Integration factories keyed by provider name.
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    factories: HashMap<String, IntegrationFactory>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            provider::GENERIC_MQTT,
            Arc::new(|ctx: &IntegrationContext| {
                Box::new(GenericMqtt::new(ctx.store.clone(), ctx.request_timeout)) as Box<dyn Integration>
            }),
        );
        registry.register(
            provider::INITIAL_STATE,
            Arc::new(|ctx: &IntegrationContext| {
                Box::new(InitialState::new(ctx.store.clone(), ctx.request_timeout)) as Box<dyn Integration>
            }),
        );
        registry
    }

    pub fn register(&mut self, provider: impl Into<String>, factory: IntegrationFactory) {
        self.factories.insert(provider.into(), factory);
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<_> = self.factories.keys().map(String::as_str).collect();
        providers.sort_unstable();
        providers
    }

    /// Builds an unconnected sink for `record`.
    pub fn create(
        &self,
        record: &ConnectionRecord,
        context: &IntegrationContext,
    ) -> Result<Box<dyn Integration>, IntegrationError> {
        let factory = self
            .factories
            .get(&record.provider)
            .ok_or_else(|| IntegrationError::UnknownProvider(record.provider.clone()))?;
        let mut integration = factory(context);
        integration.set_connection_record(record.clone());
        Ok(integration)
    }
}
