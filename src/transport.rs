// Transport client - one stateful Modbus/TCP connection per controller
// Never reconnects by itself; callers (the aggregator, the injector) retry

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ControllerEndpoint;
use crate::error::{Result, ScadaError};
use crate::modbus::frame::{self, FrameError, MAX_READ_COILS, MAX_READ_REGISTERS, Request, Response};
use crate::types::{CoilVector, ConnectionState, ControllerId, RegisterVector};

/// Read/write access to one controller's coils and holding registers.
///
/// Implementations serialize their operations: at most one request is in
/// flight per controller. Every operation on a client that is not
/// `Connected` fails immediately with `NotConnected`.
#[async_trait]
pub trait FieldBus: Send + Sync {
    fn controller(&self) -> &ControllerId;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    async fn read_coils(&self, start: u16, count: u16) -> Result<CoilVector>;

    async fn read_registers(&self, start: u16, count: u16) -> Result<RegisterVector>;

    async fn write_coil(&self, index: u16, value: bool) -> Result<()>;

    async fn write_register(&self, index: u16, value: u16) -> Result<()>;
}

/// TCP implementation of [`FieldBus`]
pub struct PlcClient {
    controller: ControllerId,

    /// `host:port` of the controller
    address: String,

    unit_id: u8,

    /// Bound on connect and on each request/reply exchange
    io_timeout: Duration,

    state: AtomicU8,

    transaction: AtomicU16,

    /// Live connection; the lock also serializes requests
    stream: Mutex<Option<TcpStream>>,
}

impl PlcClient {
    pub fn new(controller: ControllerId, address: impl Into<String>, unit_id: u8, io_timeout: Duration) -> Self {
        Self {
            controller,
            address: address.into(),
            unit_id,
            io_timeout,
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            transaction: AtomicU16::new(0),
            stream: Mutex::new(None),
        }
    }

    pub fn from_endpoint(endpoint: &ControllerEndpoint, io_timeout: Duration) -> Self {
        Self::new(endpoint.id.clone(), endpoint.address.clone(), endpoint.unit_id, io_timeout)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Forget the connection after a failure; the stream can't be trusted to be in sync
    fn drop_connection(&self, slot: &mut Option<TcpStream>, reason: &str) {
        if slot.take().is_some() {
            warn!(controller = %self.controller, reason, "connection lost");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn mismatch(&self, detail: impl Into<String>) -> ScadaError {
        ScadaError::ProtocolMismatch {
            controller: self.controller.clone(),
            detail: detail.into(),
        }
    }

    fn frame_error(&self, e: FrameError) -> ScadaError {
        match e {
            FrameError::Closed => ScadaError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by controller",
            )),
            FrameError::Io(e) => ScadaError::Io(e),
            other => self.mismatch(other.to_string()),
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// `extract` turns the reply into the caller's value; a reply of the wrong
    /// shape is a protocol mismatch and drops the connection. Exception
    /// replies keep the connection up.
    async fn transact<T: Send>(
        &self,
        operation: &'static str,
        request: Request,
        extract: impl FnOnce(Response) -> std::result::Result<T, String> + Send,
    ) -> Result<T> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(ScadaError::NotConnected(self.controller.clone()));
        };

        let tid = self.transaction.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let pdu = request.encode();
        let unit_id = self.unit_id;

        let exchange = timeout(self.io_timeout, async {
            frame::write_adu(stream, tid, unit_id, &pdu).await?;
            frame::read_adu(stream).await
        })
        .await;

        let adu = match exchange {
            Err(_) => {
                self.drop_connection(&mut guard, "timeout");
                return Err(ScadaError::Timeout {
                    controller: self.controller.clone(),
                    operation,
                });
            }
            Ok(Err(e)) => {
                let err = self.frame_error(e);
                self.drop_connection(&mut guard, err.kind());
                return Err(err);
            }
            Ok(Ok(adu)) => adu,
        };

        if adu.header.transaction_id != tid || adu.header.unit_id != unit_id {
            self.drop_connection(&mut guard, "reply header mismatch");
            return Err(self.mismatch(format!(
                "{}: expected tid {} unit {}, got tid {} unit {}",
                operation, tid, unit_id, adu.header.transaction_id, adu.header.unit_id
            )));
        }

        let response = match Response::decode(&adu.pdu) {
            Ok(r) => r,
            Err(e) => {
                self.drop_connection(&mut guard, "undecodable reply");
                return Err(self.mismatch(format!("{}: {}", operation, e)));
            }
        };

        if let Response::Exception { function, code } = response {
            if function != request.function_code() {
                self.drop_connection(&mut guard, "exception for wrong function");
                return Err(self.mismatch(format!(
                    "{}: exception for function 0x{:02X}",
                    operation, function
                )));
            }
            debug!(controller = %self.controller, operation, code, "device exception");
            return Err(ScadaError::DeviceException {
                controller: self.controller.clone(),
                function,
                code,
            });
        }

        match extract(response) {
            Ok(value) => Ok(value),
            Err(detail) => {
                self.drop_connection(&mut guard, "reply shape mismatch");
                Err(self.mismatch(format!("{}: {}", operation, detail)))
            }
        }
    }

    fn check_count(&self, count: u16, max: u16) -> Result<()> {
        if count == 0 || count > max {
            return Err(ScadaError::config(format!(
                "{}: request count {} outside 1..={}",
                self.controller, count, max
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FieldBus for PlcClient {
    fn controller(&self) -> &ControllerId {
        &self.controller
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        match timeout(self.io_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                // Small request/reply frames; don't let Nagle batch them
                let _ = stream.set_nodelay(true);
                *guard = Some(stream);
                self.set_state(ConnectionState::Connected);
                info!(controller = %self.controller, address = %self.address, "connected");
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                debug!(controller = %self.controller, address = %self.address, error = %e, "connect failed");
                Err(ScadaError::Io(e))
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                debug!(controller = %self.controller, address = %self.address, "connect timed out");
                Err(ScadaError::Timeout {
                    controller: self.controller.clone(),
                    operation: "connect",
                })
            }
        }
    }

    async fn disconnect(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
            info!(controller = %self.controller, "disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn read_coils(&self, start: u16, count: u16) -> Result<CoilVector> {
        self.check_count(count, MAX_READ_COILS)?;
        self.transact("read_coils", Request::ReadCoils { start, count }, move |reply| match reply {
            Response::ReadCoils { packed } => {
                let expected = (count as usize).div_ceil(8);
                if packed.len() != expected {
                    return Err(format!("{} coil bytes, expected {}", packed.len(), expected));
                }
                Ok(frame::unpack_bits(&packed, count as usize))
            }
            other => Err(format!("unexpected reply {:?}", other)),
        })
        .await
    }

    async fn read_registers(&self, start: u16, count: u16) -> Result<RegisterVector> {
        self.check_count(count, MAX_READ_REGISTERS)?;
        self.transact(
            "read_registers",
            Request::ReadHoldingRegisters { start, count },
            move |reply| match reply {
                Response::ReadHoldingRegisters { values } if values.len() == count as usize => Ok(values),
                Response::ReadHoldingRegisters { values } => {
                    Err(format!("{} registers, expected {}", values.len(), count))
                }
                other => Err(format!("unexpected reply {:?}", other)),
            },
        )
        .await
    }

    async fn write_coil(&self, index: u16, value: bool) -> Result<()> {
        self.transact(
            "write_coil",
            Request::WriteSingleCoil { address: index, value },
            move |reply| match reply {
                Response::WriteSingleCoil { address, value: echoed } if address == index && echoed == value => Ok(()),
                other => Err(format!("write echo disagrees: {:?}", other)),
            },
        )
        .await
    }

    async fn write_register(&self, index: u16, value: u16) -> Result<()> {
        self.transact(
            "write_register",
            Request::WriteSingleRegister { address: index, value },
            move |reply| match reply {
                Response::WriteSingleRegister { address, value: echoed } if address == index && echoed == value => {
                    Ok(())
                }
                other => Err(format!("write echo disagrees: {:?}", other)),
            },
        )
        .await
    }
}
