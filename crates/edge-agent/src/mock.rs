//! # Test Doubles
//!
//! Hand-written stand-ins for the agent's two driver seams:
//!
//! - [`ScriptedDriver`] / [`ScriptedSession`]: a field-bus device whose register values
//!   and read failures are fixed up front by a [`SessionScript`].
//! - [`Recorder`]: an integration factory whose sinks log every call instead of talking
//!   to a back-end, with per-endpoint failure injection.
//! - [`FakeBroker`]: a loopback MQTT 3.1.1 broker that acknowledges and records every
//!   publish, for exercising the real GenericMQTT sink.
//!
//! ```rust
//! use edge_agent::fieldbus::read_all;
//! use edge_agent::mock::{ScriptedSession, SessionScript};
//! use edge_agent::model::{MachineIntegration, RegisterEntry, SampleValue};
//!
//! #[tokio::main]
//! async fn main() {
//!     let map = MachineIntegration {
//!         modbus: vec![RegisterEntry {
//!             register_name: "TankFull".into(),
//!             address: 0,
//!             functions: vec![2],
//!             ..Default::default()
//!         }],
//!     };
//!     let mut session = ScriptedSession::new(SessionScript::default().discrete_input(0, true));
//!     let samples = read_all(&mut session, &map).await.unwrap();
//!     assert_eq!(samples["TankFull"], SampleValue::Bit(true));
//! }
//! ```

use crate::error::{FieldbusError, IntegrationError};
use crate::fieldbus::{function, i16_to_bytes, FieldbusDriver, FieldbusSession};
use crate::integrations::{Integration, IntegrationContext, IntegrationFactory};
use crate::model::{ConnectionRecord, HealthRecord, SampleSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Modbus "illegal data address", returned for unscripted reads.
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Shared call count.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Register contents and injected failures, keyed by function code and address.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    values: HashMap<(u8, u16), Vec<u8>>,
    failures: HashSet<(u8, u16)>,
}

impl SessionScript {
    pub fn discrete_input(self, address: u16, value: bool) -> Self {
        self.value(function::READ_DISCRETE_INPUTS, address, vec![value as u8])
    }

    pub fn coil(self, address: u16, value: bool) -> Self {
        self.value(function::READ_COILS, address, vec![value as u8])
    }

    pub fn holding_register(self, address: u16, value: i16) -> Self {
        self.value(function::READ_HOLDING_REGISTERS, address, i16_to_bytes(value).to_vec())
    }

    pub fn input_register(self, address: u16, value: i16) -> Self {
        self.value(function::READ_INPUT_REGISTERS, address, i16_to_bytes(value).to_vec())
    }

    pub fn fail_coil(self, address: u16) -> Self {
        self.fail(function::READ_COILS, address)
    }

    /// Reads of `address` with `function` fail with an I/O error.
    pub fn fail(mut self, function: u8, address: u16) -> Self {
        self.failures.insert((function, address));
        self
    }

    fn value(mut self, function: u8, address: u16, bytes: Vec<u8>) -> Self {
        self.values.insert((function, address), bytes);
        self
    }
}

pub struct ScriptedSession {
    script: SessionScript,
    closes: CallCounter,
}

impl ScriptedSession {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            closes: CallCounter::default(),
        }
    }

    pub fn close_counter(&self) -> CallCounter {
        self.closes.clone()
    }

    fn read(&self, function: u8, address: u16) -> Result<Vec<u8>, FieldbusError> {
        if self.script.failures.contains(&(function, address)) {
            return Err(FieldbusError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "scripted read failure",
            )));
        }
        self.script
            .values
            .get(&(function, address))
            .cloned()
            .ok_or(FieldbusError::Exception {
                function,
                code: ILLEGAL_DATA_ADDRESS,
            })
    }
}

#[async_trait]
impl FieldbusSession for ScriptedSession {
    async fn read_discrete_inputs(&mut self, address: u16, _count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_DISCRETE_INPUTS, address)
    }

    async fn read_coils(&mut self, address: u16, _count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_COILS, address)
    }

    async fn read_holding_registers(&mut self, address: u16, _count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_HOLDING_REGISTERS, address)
    }

    async fn read_input_registers(&mut self, address: u16, _count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_INPUT_REGISTERS, address)
    }

    async fn close(&mut self) -> Result<(), FieldbusError> {
        self.closes.bump();
        Ok(())
    }
}

/// Opens [`ScriptedSession`]s that all share one script and one close counter.
pub struct ScriptedDriver {
    script: SessionScript,
    refuse: bool,
    connects: CallCounter,
    closes: CallCounter,
    endpoints: Arc<Mutex<Vec<(String, u16)>>>,
}

impl ScriptedDriver {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            refuse: false,
            connects: CallCounter::default(),
            closes: CallCounter::default(),
            endpoints: Arc::default(),
        }
    }

    /// Every connect attempt times out.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(SessionScript::default())
        }
    }

    pub fn connect_counter(&self) -> CallCounter {
        self.connects.clone()
    }

    pub fn close_counter(&self) -> CallCounter {
        self.closes.clone()
    }

    /// `(endpoint, port)` of every connect attempt, in order.
    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl FieldbusDriver for ScriptedDriver {
    async fn connect(
        &self,
        endpoint: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn FieldbusSession>, FieldbusError> {
        self.connects.bump();
        self.endpoints.lock().push((endpoint.to_string(), port));
        if self.refuse {
            return Err(FieldbusError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout,
            });
        }
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            closes: self.closes.clone(),
        }))
    }
}

/// One call made on a [`RecordingIntegration`], tagged with the sink's endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationCall {
    Connect(String),
    Close(String),
    SendState(String, HealthRecord),
    SendData(String, SampleSet),
}

impl IntegrationCall {
    pub fn endpoint(&self) -> &str {
        match self {
            IntegrationCall::Connect(endpoint)
            | IntegrationCall::Close(endpoint)
            | IntegrationCall::SendState(endpoint, _)
            | IntegrationCall::SendData(endpoint, _) => endpoint,
        }
    }
}

#[derive(Default)]
struct RecorderState {
    calls: Vec<IntegrationCall>,
    failing_sends: HashSet<String>,
    failing_connects: HashSet<String>,
}

/// Shared log behind every [`RecordingIntegration`] its factory creates.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> IntegrationFactory {
        let recorder = self.clone();
        Arc::new(move |_: &IntegrationContext| {
            Box::new(RecordingIntegration {
                record: ConnectionRecord::default(),
                recorder: recorder.clone(),
            }) as Box<dyn Integration>
        })
    }

    /// Sends to sinks with this endpoint fail.
    pub fn fail_sends_to(&self, endpoint: impl Into<String>) {
        self.state.lock().failing_sends.insert(endpoint.into());
    }

    /// Connects to sinks with this endpoint fail.
    pub fn fail_connects_to(&self, endpoint: impl Into<String>) {
        self.state.lock().failing_connects.insert(endpoint.into());
    }

    pub fn calls(&self) -> Vec<IntegrationCall> {
        self.state.lock().calls.clone()
    }

    /// Sample sets sent to sinks with this endpoint.
    pub fn data_sent_to(&self, endpoint: &str) -> Vec<SampleSet> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                IntegrationCall::SendData(e, samples) if e == endpoint => Some(samples.clone()),
                _ => None,
            })
            .collect()
    }

    /// Health records sent to sinks with this endpoint.
    pub fn state_sent_to(&self, endpoint: &str) -> Vec<HealthRecord> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                IntegrationCall::SendState(e, record) if e == endpoint => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    fn log(&self, call: IntegrationCall) -> Result<(), IntegrationError> {
        let mut state = self.state.lock();
        let endpoint = call.endpoint().to_string();
        let fails = match &call {
            IntegrationCall::Connect(_) => state.failing_connects.contains(&endpoint),
            IntegrationCall::SendState(..) | IntegrationCall::SendData(..) => {
                state.failing_sends.contains(&endpoint)
            }
            IntegrationCall::Close(_) => false,
        };
        state.calls.push(call);
        if fails {
            return Err(IntegrationError::Transport(format!("{endpoint} scripted to fail")));
        }
        Ok(())
    }
}

pub struct RecordingIntegration {
    record: ConnectionRecord,
    recorder: Recorder,
}

#[async_trait]
impl Integration for RecordingIntegration {
    fn set_connection_record(&mut self, record: ConnectionRecord) {
        self.record = record;
    }

    fn connection_record(&self) -> &ConnectionRecord {
        &self.record
    }

    async fn connect(&mut self) -> Result<(), IntegrationError> {
        self.recorder
            .log(IntegrationCall::Connect(self.record.endpoint.clone()))
    }

    async fn close(&mut self) -> Result<(), IntegrationError> {
        self.recorder
            .log(IntegrationCall::Close(self.record.endpoint.clone()))
    }

    async fn send_state(&mut self, record: &HealthRecord) -> Result<(), IntegrationError> {
        self.recorder.log(IntegrationCall::SendState(
            self.record.endpoint.clone(),
            record.clone(),
        ))
    }

    async fn send_data(&mut self, samples: &SampleSet) -> Result<(), IntegrationError> {
        self.recorder.log(IntegrationCall::SendData(
            self.record.endpoint.clone(),
            samples.clone(),
        ))
    }
}

/// Polls `condition` until it holds; panics after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within 5s");
}

/// MQTT control packet types, as the high nibble of the fixed header.
pub mod mqtt_packet {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

/// One PUBLISH as seen on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub packet_id: u16,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

/// Loopback MQTT broker: accepts any client, acknowledges QoS 1 publishes and answers
/// pings. Every publish from every connection is queued for [`FakeBroker::next_publish`].
pub struct FakeBroker {
    port: u16,
    published: mpsc::UnboundedReceiver<Published>,
}

impl FakeBroker {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let (tx, published) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_client(socket, tx.clone()));
            }
        });
        Ok(Self { port, published })
    }

    /// `tcp://127.0.0.1:<port>`, ready for a connection record.
    pub fn endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// The next publish, or `None` if none arrives within five seconds.
    pub async fn next_publish(&mut self) -> Option<Published> {
        tokio::time::timeout(Duration::from_secs(5), self.published.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn serve_client(mut socket: TcpStream, published: mpsc::UnboundedSender<Published>) {
    while let Ok((header, body)) = read_packet(&mut socket).await {
        let reply = match header >> 4 {
            mqtt_packet::CONNECT => Some(vec![mqtt_packet::CONNACK << 4, 2, 0, 0]),
            mqtt_packet::PUBLISH => match parse_publish(header, &body) {
                Some(publish) => {
                    let ack = (header & 0x06 != 0).then(|| puback(publish.packet_id));
                    let _ = published.send(publish);
                    ack
                }
                None => return,
            },
            mqtt_packet::PINGREQ => Some(vec![mqtt_packet::PINGRESP << 4, 0]),
            mqtt_packet::DISCONNECT => return,
            _ => None,
        };
        if let Some(reply) = reply {
            if socket.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// PUBACK for `packet_id`.
pub fn puback(packet_id: u16) -> Vec<u8> {
    let id = packet_id.to_be_bytes();
    vec![mqtt_packet::PUBACK << 4, 2, id[0], id[1]]
}

/// Decodes a PUBLISH body; the packet id is zero for QoS 0.
pub fn parse_publish(header: u8, body: &[u8]) -> Option<Published> {
    let topic_len = u16::from_be_bytes([*body.first()?, *body.get(1)?]) as usize;
    let topic = String::from_utf8(body.get(2..2 + topic_len)?.to_vec()).ok()?;
    let mut rest = &body[2 + topic_len..];
    let mut packet_id = 0;
    if header & 0x06 != 0 {
        packet_id = u16::from_be_bytes([*rest.first()?, *rest.get(1)?]);
        rest = &rest[2..];
    }
    Some(Published {
        topic,
        packet_id,
        payload: rest.to_vec(),
    })
}

/// Reads one MQTT control packet; returns its fixed-header byte and its body.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u8, Vec<u8>)> {
    let header = reader.read_u8().await?;
    let mut len = 0usize;
    let mut multiplier = 1usize;
    for _ in 0..4 {
        let byte = reader.read_u8().await?;
        len += (byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            return Ok((header, body));
        }
        multiplier *= 128;
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "remaining length exceeds four bytes",
    ))
}
