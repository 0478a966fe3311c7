// Simulated PLC - Modbus/TCP server holding one coil bank and one register bank
// Serves the HMI poller and any other client (including an attacker) concurrently

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{self, FrameError, MAX_READ_COILS, MAX_READ_REGISTERS, Request, Response, exception};
use crate::config::ControllerEndpoint;

/// Controller I/O image. Whoever holds the lock stands in for ladder logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcMemory {
    pub coils: Vec<bool>,
    pub registers: Vec<u16>,
}

impl PlcMemory {
    pub fn new(coil_count: usize, register_count: usize) -> Self {
        Self {
            coils: vec![false; coil_count],
            registers: vec![0; register_count],
        }
    }

    fn window(start: u16, count: u16, max: u16, len: usize) -> Result<std::ops::Range<usize>, u8> {
        if count == 0 || count > max {
            return Err(exception::ILLEGAL_DATA_VALUE);
        }
        let start = start as usize;
        let end = start + count as usize;
        if end > len {
            return Err(exception::ILLEGAL_DATA_ADDRESS);
        }
        Ok(start..end)
    }

    fn apply(&mut self, request: Request) -> Result<Response, u8> {
        match request {
            Request::ReadCoils { start, count } => {
                let range = Self::window(start, count, MAX_READ_COILS, self.coils.len())?;
                Ok(Response::ReadCoils {
                    packed: frame::pack_bits(&self.coils[range]),
                })
            }
            Request::ReadHoldingRegisters { start, count } => {
                let range = Self::window(start, count, MAX_READ_REGISTERS, self.registers.len())?;
                Ok(Response::ReadHoldingRegisters {
                    values: self.registers[range].to_vec(),
                })
            }
            Request::WriteSingleCoil { address, value } => {
                let slot = self
                    .coils
                    .get_mut(address as usize)
                    .ok_or(exception::ILLEGAL_DATA_ADDRESS)?;
                *slot = value;
                Ok(Response::WriteSingleCoil { address, value })
            }
            Request::WriteSingleRegister { address, value } => {
                let slot = self
                    .registers
                    .get_mut(address as usize)
                    .ok_or(exception::ILLEGAL_DATA_ADDRESS)?;
                *slot = value;
                Ok(Response::WriteSingleRegister { address, value })
            }
        }
    }
}

/// Injected misbehaviour, switchable while the simulator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    None,
    /// Close every connection on its next request without replying
    DropConnections,
    /// Answer coil reads with one byte fewer than requested
    ShortCoilReply,
}

impl FaultMode {
    fn to_u8(self) -> u8 {
        match self {
            FaultMode::None => 0,
            FaultMode::DropConnections => 1,
            FaultMode::ShortCoilReply => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FaultMode::DropConnections,
            2 => FaultMode::ShortCoilReply,
            _ => FaultMode::None,
        }
    }
}

struct Shared {
    name: String,
    memory: Arc<Mutex<PlcMemory>>,
    fault: AtomicU8,
    requests: AtomicU64,
}

impl Shared {
    fn fault(&self) -> FaultMode {
        FaultMode::from_u8(self.fault.load(Ordering::Acquire))
    }
}

pub struct PlcSimulator {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl PlcSimulator {
    /// Bind and start serving. Port 0 picks an ephemeral port.
    pub async fn bind(addr: &str, coil_count: usize, register_count: usize) -> std::io::Result<Self> {
        Self::bind_named(addr, addr, coil_count, register_count).await
    }

    /// Serve the I/O image declared for `endpoint` on its configured address
    pub async fn for_endpoint(endpoint: &ControllerEndpoint) -> std::io::Result<Self> {
        Self::bind_named(
            endpoint.id.as_str(),
            &endpoint.address,
            endpoint.coil_count,
            endpoint.register_count,
        )
        .await
    }

    pub async fn bind_named(
        name: &str,
        addr: &str,
        coil_count: usize,
        register_count: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            name: name.to_string(),
            memory: Arc::new(Mutex::new(PlcMemory::new(coil_count, register_count))),
            fault: AtomicU8::new(FaultMode::None.to_u8()),
            requests: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        info!(plc = %name, addr = %local_addr, coil_count, register_count, "simulated PLC listening");

        let accept_task = tokio::spawn(Self::accept_loop(listener, Arc::clone(&shared), cancel.clone()));

        Ok(Self {
            shared,
            local_addr,
            cancel,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Handle on the I/O image for tests and the embedding program
    pub fn memory(&self) -> Arc<Mutex<PlcMemory>> {
        Arc::clone(&self.shared.memory)
    }

    pub fn set_fault(&self, mode: FaultMode) {
        self.shared.fault.store(mode.to_u8(), Ordering::Release);
    }

    pub fn fault(&self) -> FaultMode {
        self.shared.fault()
    }

    /// Requests answered so far, across all sessions
    pub fn requests_served(&self) -> u64 {
        self.shared.requests.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every open session
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_task.await {
            warn!(plc = %self.shared.name, error = %e, "accept task ended abnormally");
        }
        info!(plc = %self.shared.name, "simulated PLC stopped");
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        let cancel = cancel.clone();
                        sessions.spawn(async move {
                            debug!(plc = %shared.name, %peer, "session opened");
                            match Self::handle_connection(stream, &shared, cancel).await {
                                Ok(()) => debug!(plc = %shared.name, %peer, "session closed"),
                                Err(e) => warn!(plc = %shared.name, %peer, error = %e, "session error"),
                            }
                        });
                    }
                    Err(e) => warn!(plc = %shared.name, error = %e, "accept error"),
                },
            }
        }

        sessions.shutdown().await;
    }

    async fn handle_connection(
        mut stream: TcpStream,
        shared: &Shared,
        cancel: CancellationToken,
    ) -> Result<(), FrameError> {
        loop {
            let adu = tokio::select! {
                _ = cancel.cancelled() => break,
                read = frame::read_adu(&mut stream) => match read {
                    Ok(adu) => adu,
                    Err(FrameError::Closed) => break,
                    Err(e) => return Err(e),
                },
            };

            let fault = shared.fault();
            if fault == FaultMode::DropConnections {
                debug!(plc = %shared.name, "dropping connection (fault injected)");
                break;
            }

            let function = adu.pdu.first().copied().unwrap_or(0);
            let response = match Request::decode(&adu.pdu) {
                Ok(request) => Self::process_request(request, shared, fault).await,
                Err(FrameError::UnknownFunction(code)) => Response::Exception {
                    function: code,
                    code: exception::ILLEGAL_FUNCTION,
                },
                Err(FrameError::Malformed(reason)) => {
                    debug!(plc = %shared.name, reason, "malformed request");
                    Response::Exception {
                        function,
                        code: exception::ILLEGAL_DATA_VALUE,
                    }
                }
                Err(e) => return Err(e),
            };

            frame::write_adu(
                &mut stream,
                adu.header.transaction_id,
                adu.header.unit_id,
                &response.encode(),
            )
            .await?;
            shared.requests.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    async fn process_request(request: Request, shared: &Shared, fault: FaultMode) -> Response {
        let result = shared.memory.lock().await.apply(request);

        match result {
            Ok(Response::ReadCoils { mut packed }) if fault == FaultMode::ShortCoilReply => {
                packed.pop();
                Response::ReadCoils { packed }
            }
            Ok(response) => response,
            Err(code) => Response::Exception {
                function: request.function_code(),
                code,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_read_window_bounds() {
        let mut mem = PlcMemory::new(15, 31);
        assert!(mem.apply(Request::ReadCoils { start: 0, count: 15 }).is_ok());
        assert_eq!(
            mem.apply(Request::ReadCoils { start: 10, count: 6 }),
            Err(exception::ILLEGAL_DATA_ADDRESS)
        );
        assert_eq!(
            mem.apply(Request::ReadHoldingRegisters { start: 0, count: 0 }),
            Err(exception::ILLEGAL_DATA_VALUE)
        );
    }

    #[test]
    fn test_memory_write_then_read() {
        let mut mem = PlcMemory::new(4, 4);
        mem.apply(Request::WriteSingleCoil {
            address: 2,
            value: true,
        })
        .unwrap();
        mem.apply(Request::WriteSingleRegister {
            address: 3,
            value: 0xBEEF,
        })
        .unwrap();

        assert_eq!(mem.coils, vec![false, false, true, false]);
        assert_eq!(mem.registers[3], 0xBEEF);
        assert_eq!(
            mem.apply(Request::WriteSingleCoil {
                address: 4,
                value: true
            }),
            Err(exception::ILLEGAL_DATA_ADDRESS)
        );
    }

    #[test]
    fn test_fault_mode_raw_conversion() {
        for mode in [FaultMode::None, FaultMode::DropConnections, FaultMode::ShortCoilReply] {
            assert_eq!(FaultMode::from_u8(mode.to_u8()), mode);
        }
    }

    #[tokio::test]
    async fn test_simulator_answers_unknown_function_with_exception() {
        let sim = PlcSimulator::bind("127.0.0.1:0", 4, 4).await.unwrap();
        let mut stream = TcpStream::connect(sim.local_addr()).await.unwrap();

        // 0x10 = write multiple registers, not implemented
        frame::write_adu(&mut stream, 9, 1, &[0x10, 0x00, 0x00, 0x00, 0x01])
            .await
            .unwrap();
        let reply = frame::read_adu(&mut stream).await.unwrap();
        assert_eq!(reply.header.transaction_id, 9);
        assert_eq!(
            Response::decode(&reply.pdu).unwrap(),
            Response::Exception {
                function: 0x10,
                code: exception::ILLEGAL_FUNCTION
            }
        );

        sim.shutdown().await;
    }

    #[tokio::test]
    async fn test_short_coil_reply_fault() {
        let sim = PlcSimulator::bind("127.0.0.1:0", 15, 1).await.unwrap();
        sim.set_fault(FaultMode::ShortCoilReply);
        let mut stream = TcpStream::connect(sim.local_addr()).await.unwrap();

        let pdu = Request::ReadCoils { start: 0, count: 15 }.encode();
        frame::write_adu(&mut stream, 1, 1, &pdu).await.unwrap();
        let reply = frame::read_adu(&mut stream).await.unwrap();
        match Response::decode(&reply.pdu).unwrap() {
            Response::ReadCoils { packed } => assert_eq!(packed.len(), 1),
            other => panic!("unexpected reply {:?}", other),
        }

        sim.shutdown().await;
    }
}
