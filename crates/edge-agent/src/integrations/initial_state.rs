//! InitialState REST sink.
//!
//! Two buckets per machine: `state|<entity>/<location>/<machineId>` holds the fixed
//! health keys, `ops|…` holds one key per register name. Connecting creates both
//! (a no-op if they exist); every send posts an event array to `events`.

use super::Integration;
use crate::config_store::ConfigStore;
use crate::error::IntegrationError;
use crate::model::connectivity::provider;
use crate::model::{Asset, ConnectionRecord, HealthRecord, SampleSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const ACCESS_KEY_HEADER: &str = "X-IS-AccessKey";
const BUCKET_KEY_HEADER: &str = "X-IS-BucketKey";
const MEDIA_TYPE: &str = "application/json";
const MAX_IDLE_CONNECTIONS: usize = 10;
const ISO8601: &str = "%Y-%m-%dT%H:%M:%SZ";

mod resource {
    pub const EVENTS: &str = "events";
    pub const BUCKETS: &str = "buckets";
    pub const VERSIONS: &str = "versions";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub iso8601: String,
    pub key: String,
    pub value: Value,
}

pub struct InitialState {
    record: ConnectionRecord,
    store: ConfigStore,
    timeout: Duration,
    client: Option<Client>,
}

impl InitialState {
    pub fn new(store: ConfigStore, timeout: Duration) -> Self {
        Self {
            record: ConnectionRecord::default(),
            store,
            timeout,
            client: None,
        }
    }

    async fn request(
        &self,
        method: Method,
        resource: &str,
        bucket: Option<&str>,
        body: Option<Value>,
    ) -> Result<(), IntegrationError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| IntegrationError::NotConnected(provider::INITIAL_STATE.into()))?;
        let url = format!("{}/{}", self.record.endpoint.trim_end_matches('/'), resource);

        let mut request = client
            .request(method, &url)
            .header(CONTENT_TYPE, MEDIA_TYPE)
            .header(ACCESS_KEY_HEADER, self.record.provider_key.as_str());
        if let Some(bucket) = bucket {
            request = request.header(BUCKET_KEY_HEADER, bucket);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?.error_for_status()?;
        debug!(%url, status = %response.status(), "InitialState request complete");
        Ok(())
    }
}

#[async_trait]
impl Integration for InitialState {
    fn set_connection_record(&mut self, record: ConnectionRecord) {
        self.record = record;
    }

    fn connection_record(&self) -> &ConnectionRecord {
        &self.record
    }

    async fn connect(&mut self) -> Result<(), IntegrationError> {
        if self.record.endpoint.is_empty() {
            return Err(IntegrationError::MissingEndpoint(provider::INITIAL_STATE.into()));
        }
        self.client = Some(
            Client::builder()
                .timeout(self.timeout)
                .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
                .build()?,
        );

        let asset = self.store.asset();
        self.request(Method::GET, resource::VERSIONS, None, None).await?;
        for bucket in [state_bucket(&asset), ops_bucket(&asset)] {
            let body = json!({ "bucketKey": bucket });
            self.request(Method::POST, resource::BUCKETS, Some(bucket.as_str()), Some(body))
                .await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IntegrationError> {
        self.client = None;
        Ok(())
    }

    async fn send_state(&mut self, record: &HealthRecord) -> Result<(), IntegrationError> {
        let bucket = state_bucket(&self.store.asset());
        let events = serde_json::to_value(state_events(record))?;
        self.request(Method::POST, resource::EVENTS, Some(bucket.as_str()), Some(events))
            .await
    }

    async fn send_data(&mut self, samples: &SampleSet) -> Result<(), IntegrationError> {
        let bucket = ops_bucket(&self.store.asset());
        let events = serde_json::to_value(ops_events(Utc::now(), samples)?)?;
        self.request(Method::POST, resource::EVENTS, Some(bucket.as_str()), Some(events))
            .await
    }
}

pub fn state_bucket(asset: &Asset) -> String {
    format!("state|{}/{}/{}", asset.entity, asset.location, asset.machine_id)
}

pub fn ops_bucket(asset: &Asset) -> String {
    format!("ops|{}/{}/{}", asset.entity, asset.location, asset.machine_id)
}

pub fn state_events(record: &HealthRecord) -> Vec<Event> {
    let iso8601 = record.timestamp.format(ISO8601).to_string();
    [
        ("memoryConsumed", record.memory_consumed),
        ("diskConsumed", record.disk_consumed),
        ("loadAverage", record.load_average),
    ]
    .into_iter()
    .map(|(key, value)| Event {
        iso8601: iso8601.clone(),
        key: key.to_string(),
        value: json!(value),
    })
    .collect()
}

pub fn ops_events(timestamp: DateTime<Utc>, samples: &SampleSet) -> Result<Vec<Event>, IntegrationError> {
    let iso8601 = timestamp.format(ISO8601).to_string();
    samples
        .iter()
        .map(|(key, value)| {
            Ok(Event {
                iso8601: iso8601.clone(),
                key: key.clone(),
                value: serde_json::to_value(value)?,
            })
        })
        .collect()
}
