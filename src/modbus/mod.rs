// Modbus/TCP field bus: wire codec and an in-process controller

pub mod frame;
pub mod server;

pub use frame::{FrameError, Request, Response};
pub use server::{FaultMode, PlcMemory, PlcSimulator};
