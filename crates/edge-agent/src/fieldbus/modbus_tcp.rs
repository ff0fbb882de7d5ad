//! # Modbus TCP
//!
//! Minimal Modbus TCP client: the four read functions over MBAP framing.
//!
//! ```text
//! request  = MBAP(7) | function(1) | address(2) | count(2)
//! response = MBAP(7) | function(1) | byte count(1) | data(n)
//! error    = MBAP(7) | function|0x80(1) | exception code(1)
//! MBAP     = transaction(2) | protocol=0(2) | length(2) | unit(1)
//! ```

use super::{bytes_to_u16, function, u16_to_bytes, FieldbusDriver, FieldbusSession};
use crate::error::FieldbusError;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 502;
const MBAP_LEN: usize = 7;
const EXCEPTION_FLAG: u8 = 0x80;
const MAX_PDU: usize = 253;

pub struct ModbusTcpDriver {
    unit_id: u8,
}

impl ModbusTcpDriver {
    pub fn new(unit_id: u8) -> Self {
        Self { unit_id }
    }
}

#[async_trait]
impl FieldbusDriver for ModbusTcpDriver {
    async fn connect(
        &self,
        endpoint: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn FieldbusSession>, FieldbusError> {
        let port = if port == 0 { DEFAULT_PORT } else { port };
        let address = format!("{endpoint}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| FieldbusError::ConnectTimeout {
                endpoint: address.clone(),
                timeout,
            })??;
        stream.set_nodelay(true)?;
        debug!(%address, unit = self.unit_id, "Modbus session opened");
        Ok(Box::new(ModbusTcpSession {
            stream,
            address,
            unit_id: self.unit_id,
            transaction: 0,
            timeout,
        }))
    }
}

pub struct ModbusTcpSession {
    stream: TcpStream,
    address: String,
    unit_id: u8,
    transaction: u16,
    timeout: Duration,
}

impl ModbusTcpSession {
    async fn read(&mut self, function: u8, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.transaction = self.transaction.wrapping_add(1);
        let request = encode_read_request(self.transaction, self.unit_id, function, address, count);
        let exchange = async {
            self.stream.write_all(&request).await?;
            let mut header = [0u8; MBAP_LEN];
            self.stream.read_exact(&mut header).await?;
            let pdu_len = check_header(&header, self.transaction)?;
            let mut pdu = vec![0u8; pdu_len];
            self.stream.read_exact(&mut pdu).await?;
            parse_read_pdu(function, count, &pdu)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                FieldbusError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no response from {} within {:?}", self.address, self.timeout),
                ))
            })?
    }
}

#[async_trait]
impl FieldbusSession for ModbusTcpSession {
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_DISCRETE_INPUTS, address, count).await
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_COILS, address, count).await
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_HOLDING_REGISTERS, address, count).await
    }

    async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u8>, FieldbusError> {
        self.read(function::READ_INPUT_REGISTERS, address, count).await
    }

    async fn close(&mut self) -> Result<(), FieldbusError> {
        self.stream.shutdown().await?;
        debug!(address = %self.address, "Modbus session closed");
        Ok(())
    }
}

pub fn encode_read_request(transaction: u16, unit: u8, function: u8, address: u16, count: u16) -> [u8; 12] {
    let [t_hi, t_lo] = u16_to_bytes(transaction);
    let [a_hi, a_lo] = u16_to_bytes(address);
    let [c_hi, c_lo] = u16_to_bytes(count);
    // Length covers unit id + PDU.
    [t_hi, t_lo, 0, 0, 0, 6, unit, function, a_hi, a_lo, c_hi, c_lo]
}

/// Validates an MBAP header and returns the number of PDU bytes that follow it.
fn check_header(header: &[u8; MBAP_LEN], transaction: u16) -> Result<usize, FieldbusError> {
    let received = bytes_to_u16(&header[0..2])?;
    if received != transaction {
        return Err(FieldbusError::MalformedResponse(format!(
            "transaction id {received} does not match {transaction}"
        )));
    }
    let protocol = bytes_to_u16(&header[2..4])?;
    if protocol != 0 {
        return Err(FieldbusError::MalformedResponse(format!(
            "protocol id {protocol} is not Modbus"
        )));
    }
    let length = bytes_to_u16(&header[4..6])? as usize;
    if length < 2 || length - 1 > MAX_PDU {
        return Err(FieldbusError::MalformedResponse(format!(
            "invalid length {length}"
        )));
    }
    Ok(length - 1)
}

/// Extracts the data bytes of a read response PDU.
pub fn parse_read_pdu(function: u8, count: u16, pdu: &[u8]) -> Result<Vec<u8>, FieldbusError> {
    match pdu {
        [code, exception, ..] if *code == function | EXCEPTION_FLAG => Err(FieldbusError::Exception {
            function,
            code: *exception,
        }),
        [code, byte_count, data @ ..] if *code == function => {
            let expected = match function {
                function::READ_COILS | function::READ_DISCRETE_INPUTS => (count as usize).div_ceil(8),
                _ => count as usize * 2,
            };
            if *byte_count as usize != data.len() || data.len() != expected {
                return Err(FieldbusError::MalformedResponse(format!(
                    "expected {expected} data bytes, byte count {byte_count}, got {}",
                    data.len()
                )));
            }
            Ok(data.to_vec())
        }
        [code, ..] => Err(FieldbusError::MalformedResponse(format!(
            "function {code:#04x} in response to {function:#04x}"
        ))),
        [] => Err(FieldbusError::MalformedResponse("empty response".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn request_frame_layout() {
        assert_eq!(
            encode_read_request(0x0102, 1, function::READ_HOLDING_REGISTERS, 0x0010, 2),
            [0x01, 0x02, 0, 0, 0, 6, 1, 3, 0x00, 0x10, 0x00, 0x02]
        );
    }

    #[test]
    fn exception_response_is_surfaced() {
        let err = parse_read_pdu(function::READ_COILS, 1, &[0x81, 0x02]).unwrap_err();
        assert!(matches!(err, FieldbusError::Exception { function: 1, code: 2 }));
    }

    #[test]
    fn short_data_is_malformed() {
        let err = parse_read_pdu(function::READ_INPUT_REGISTERS, 1, &[0x04, 0x02, 0x00]).unwrap_err();
        assert!(matches!(err, FieldbusError::MalformedResponse(_)));
    }

    /// Answers one request per connection with `reply(pdu)`.
    async fn fake_slave(reply: fn(&[u8]) -> Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            while socket.read_exact(&mut request).await.is_ok() {
                let pdu = reply(&request[7..]);
                let mut frame = vec![request[0], request[1], 0, 0];
                frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                frame.push(request[6]);
                frame.extend_from_slice(&pdu);
                socket.write_all(&frame).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn reads_registers_and_bits_over_tcp() {
        let port = fake_slave(|pdu| match pdu[0] {
            function::READ_DISCRETE_INPUTS => vec![0x02, 0x01, 0x01],
            function::READ_INPUT_REGISTERS => vec![0x04, 0x02, 0xff, 0xd8],
            other => vec![other | 0x80, 0x01],
        })
        .await;

        let driver = ModbusTcpDriver::new(1);
        let mut session = driver
            .connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(session.read_discrete_inputs(0, 1).await.unwrap(), vec![0x01]);
        assert_eq!(session.read_input_registers(0, 1).await.unwrap(), vec![0xff, 0xd8]);
        assert!(matches!(
            session.read_coils(0, 1).await,
            Err(FieldbusError::Exception { function: 1, code: 1 })
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = ModbusTcpDriver::new(1)
            .connect("127.0.0.1", port, Duration::from_secs(5))
            .await;
        assert!(result.is_err());
    }
}
