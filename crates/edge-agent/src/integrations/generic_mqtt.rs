//! # GenericMQTT
//!
//! Publishes to any MQTT 3.1.1 broker. Samples go to `/ops`, health records to
//! `/state`, both at QoS 1 wrapped in an envelope tagged with the asset document:
//!
//! ```json
//! {"ts": "2024-03-01T12:00:00Z", "tags": {"machineId": "press-7"}, "body": {"TankFull": true}}
//! ```
//!
//! The session is a `rumqttc` client. Its event loop runs in a task owned by the sink
//! and matches each PUBACK to the publish that carried the same packet id, so an
//! acknowledgement that arrives after its publish gave up never completes a later one.

use super::Integration;
use crate::config_store::ConfigStore;
use crate::error::IntegrationError;
use crate::model::connectivity::provider;
use crate::model::{Asset, ConnectionRecord, HealthRecord, SampleSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 1883;
pub const OPS_TOPIC: &str = "/ops";
pub const STATE_TOPIC: &str = "/state";
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Used when the asset document has no machine id yet.
const FALLBACK_CLIENT_ID: &str = "edge-agent";

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    ts: DateTime<Utc>,
    tags: &'a Asset,
    body: &'a T,
}

/// Publishes waiting for their PUBACK.
///
/// A publish is queued before it is handed to the client; the event loop moves it to
/// `inflight` once the packet id is assigned on the way out.
#[derive(Default)]
struct Acks {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl Acks {
    fn sent(&mut self, packet_id: u16) {
        // Retransmissions after a reconnect keep their packet id.
        if self.inflight.contains_key(&packet_id) {
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(packet_id, waiter);
        }
    }

    fn acked(&mut self, packet_id: u16) {
        if let Some(waiter) = self.inflight.remove(&packet_id) {
            let _ = waiter.send(());
        }
    }
}

struct Session {
    client: AsyncClient,
    acks: Arc<Mutex<Acks>>,
    event_loop: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

pub struct GenericMqtt {
    record: ConnectionRecord,
    store: ConfigStore,
    timeout: Duration,
    session: Option<Session>,
}

impl GenericMqtt {
    pub fn new(store: ConfigStore, timeout: Duration) -> Self {
        Self {
            record: ConnectionRecord::default(),
            store,
            timeout,
            session: None,
        }
    }

    async fn publish<T: Serialize + Sync>(&mut self, topic: &str, body: &T) -> Result<(), IntegrationError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| IntegrationError::NotConnected(provider::GENERIC_MQTT.into()))?;
        let asset = self.store.asset();
        let payload = serde_json::to_vec(&Envelope {
            ts: Utc::now(),
            tags: &asset,
            body,
        })?;
        let bytes = payload.len();

        let (acked_tx, acked) = oneshot::channel();
        session.acks.lock().queued.push_back(acked_tx);
        if let Err(e) = session.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            // Never reached the event loop, so it must not claim the next packet id.
            session.acks.lock().queued.pop_back();
            return Err(e.into());
        }

        let timeout = self.timeout;
        match tokio::time::timeout(timeout, acked).await {
            Ok(Ok(())) => {
                debug!(topic, bytes, "Published");
                Ok(())
            }
            Ok(Err(_)) => Err(IntegrationError::Transport(
                "MQTT event loop ended before PUBACK".into(),
            )),
            Err(_) => Err(timed_out("PUBACK", timeout)),
        }
    }
}

#[async_trait]
impl Integration for GenericMqtt {
    fn set_connection_record(&mut self, record: ConnectionRecord) {
        self.record = record;
    }

    fn connection_record(&self) -> &ConnectionRecord {
        &self.record
    }

    async fn connect(&mut self) -> Result<(), IntegrationError> {
        let (host, port) = broker_address(&self.record.endpoint, self.record.port)?;
        let client_id = client_id(&self.store.asset());
        let address = format!("{host}:{port}");

        let mut options = MqttOptions::new(client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);
        let (client, mut events) = AsyncClient::new(options, REQUEST_CAPACITY);

        let timeout = self.timeout;
        let handshake = async {
            loop {
                if let Event::Incoming(Packet::ConnAck(_)) = events.poll().await? {
                    return Ok::<_, rumqttc::ConnectionError>(());
                }
            }
        };
        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| timed_out("CONNACK", timeout))??;
        debug!(%address, %client_id, "MQTT session established");

        let acks = Arc::new(Mutex::new(Acks::default()));
        let event_loop = tokio::spawn(drive(events, Arc::clone(&acks), address));
        self.session = Some(Session {
            client,
            acks,
            event_loop,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IntegrationError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.client.try_disconnect()?;
        if tokio::time::timeout(self.timeout, &mut session.event_loop)
            .await
            .is_err()
        {
            warn!(endpoint = %self.record.endpoint, "MQTT event loop did not finish after DISCONNECT");
        }
        Ok(())
    }

    async fn send_state(&mut self, record: &HealthRecord) -> Result<(), IntegrationError> {
        self.publish(STATE_TOPIC, record).await
    }

    async fn send_data(&mut self, samples: &SampleSet) -> Result<(), IntegrationError> {
        self.publish(OPS_TOPIC, samples).await
    }
}

/// Polls the client's event loop until DISCONNECT goes out. Connection errors are
/// logged and the next poll reconnects.
async fn drive(mut events: EventLoop, acks: Arc<Mutex<Acks>>, address: String) {
    loop {
        match events.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(packet_id))) => acks.lock().sent(packet_id),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acked(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%address, error = %e, "MQTT connection lost");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!(%address, "MQTT event loop ended");
}

fn timed_out(waiting_for: &str, timeout: Duration) -> IntegrationError {
    IntegrationError::Transport(format!("no {waiting_for} within {timeout:?}"))
}

fn client_id(asset: &Asset) -> String {
    match asset.machine_id.trim() {
        "" => FALLBACK_CLIENT_ID.to_string(),
        id => id.to_string(),
    }
}

/// Host and port for an endpoint written as `tcp://host:port`, `mqtt://host:port` or
/// `host[:port]`. Without an explicit port the record's port is used, then 1883.
pub fn broker_address(endpoint: &str, port: u16) -> Result<(String, u16), IntegrationError> {
    let host = endpoint
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');
    if host.is_empty() {
        return Err(IntegrationError::MissingEndpoint(provider::GENERIC_MQTT.into()));
    }
    if let Some((name, explicit)) = host.rsplit_once(':') {
        if let Ok(explicit) = explicit.parse::<u16>() {
            return Ok((name.to_string(), explicit));
        }
    }
    let port = if port == 0 { DEFAULT_PORT } else { port };
    Ok((host.to_string(), port))
}
