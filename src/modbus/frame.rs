//! Modbus/TCP application data unit codec.
//!
//! An ADU is the 7-byte MBAP header (transaction id, protocol id, length,
//! unit id; all big-endian) followed by the PDU (function code + payload).
//! The header's `length` counts the unit id plus the PDU. There is no
//! authentication or integrity field anywhere in the frame.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// MBAP header size on the wire
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size (function code + data)
pub const MAX_PDU_LEN: usize = 253;

/// Largest coil count a single read may request
pub const MAX_READ_COILS: u16 = 2000;

/// Largest register count a single read may request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Function codes used by the railway controllers
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

    /// Set on the function code of an exception reply
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// Exception codes returned by the simulated controllers
pub mod exception {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
}

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,
    #[error("invalid protocol id {0}")]
    BadProtocolId(u16),
    #[error("invalid MBAP length {0}")]
    BadLength(u16),
    #[error("unsupported function code 0x{0:02X}")]
    UnknownFunction(u8),
    #[error("malformed PDU: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(raw: &[u8; MBAP_HEADER_LEN]) -> Result<Self, FrameError> {
        let mut buf = &raw[..];
        let header = Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        };

        if header.protocol_id != 0 {
            return Err(FrameError::BadProtocolId(header.protocol_id));
        }
        // Length covers unit id + PDU; a PDU is at least a function code
        if header.length < 2 || header.length as usize > MAX_PDU_LEN + 1 {
            return Err(FrameError::BadLength(header.length));
        }
        Ok(header)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Bytes of PDU that follow this header
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// One complete ADU as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub header: MbapHeader,
    pub pdu: Vec<u8>,
}

/// Client-to-controller request PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadCoils { start: u16, count: u16 },
    ReadHoldingRegisters { start: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => function::READ_COILS,
            Request::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Request::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.function_code());
        match *self {
            Request::ReadCoils { start, count } | Request::ReadHoldingRegisters { start, count } => {
                buf.put_u16(start);
                buf.put_u16(count);
            }
            Request::WriteSingleCoil { address, value } => {
                buf.put_u16(address);
                buf.put_u16(if value { COIL_ON } else { COIL_OFF });
            }
            Request::WriteSingleRegister { address, value } => {
                buf.put_u16(address);
                buf.put_u16(value);
            }
        }
        buf.to_vec()
    }

    /// Decode a request PDU. Unknown function codes are reported separately
    /// so the controller can answer with an ILLEGAL_FUNCTION exception.
    pub fn decode(pdu: &[u8]) -> Result<Self, FrameError> {
        let (&code, mut body) = pdu.split_first().ok_or(FrameError::Malformed("empty PDU"))?;
        if !matches!(
            code,
            function::READ_COILS
                | function::READ_HOLDING_REGISTERS
                | function::WRITE_SINGLE_COIL
                | function::WRITE_SINGLE_REGISTER
        ) {
            return Err(FrameError::UnknownFunction(code));
        }
        if body.len() != 4 {
            return Err(FrameError::Malformed("request body must be 4 bytes"));
        }
        let first = body.get_u16();
        let second = body.get_u16();

        Ok(match code {
            function::READ_COILS => Request::ReadCoils {
                start: first,
                count: second,
            },
            function::READ_HOLDING_REGISTERS => Request::ReadHoldingRegisters {
                start: first,
                count: second,
            },
            function::WRITE_SINGLE_COIL => {
                let value = match second {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(FrameError::Malformed("coil value must be 0xFF00 or 0x0000")),
                };
                Request::WriteSingleCoil {
                    address: first,
                    value,
                }
            }
            _ => Request::WriteSingleRegister {
                address: first,
                value: second,
            },
        })
    }
}

/// Controller-to-client reply PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Coil states packed LSB-first, one bit per coil
    ReadCoils { packed: Vec<u8> },
    ReadHoldingRegisters { values: Vec<u16> },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    Exception { function: u8, code: u8 },
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Response::ReadCoils { packed } => {
                buf.put_u8(function::READ_COILS);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(packed);
            }
            Response::ReadHoldingRegisters { values } => {
                buf.put_u8(function::READ_HOLDING_REGISTERS);
                buf.put_u8((values.len() * 2) as u8);
                for v in values {
                    buf.put_u16(*v);
                }
            }
            Response::WriteSingleCoil { address, value } => {
                buf.put_u8(function::WRITE_SINGLE_COIL);
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            }
            Response::WriteSingleRegister { address, value } => {
                buf.put_u8(function::WRITE_SINGLE_REGISTER);
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Response::Exception { function, code } => {
                buf.put_u8(function | function::EXCEPTION_FLAG);
                buf.put_u8(*code);
            }
        }
        buf.to_vec()
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, FrameError> {
        let (&code, mut body) = pdu.split_first().ok_or(FrameError::Malformed("empty PDU"))?;

        if code & function::EXCEPTION_FLAG != 0 {
            if body.len() != 1 {
                return Err(FrameError::Malformed("exception body must be 1 byte"));
            }
            return Ok(Response::Exception {
                function: code & !function::EXCEPTION_FLAG,
                code: body[0],
            });
        }

        match code {
            function::READ_COILS | function::READ_HOLDING_REGISTERS => {
                if body.is_empty() {
                    return Err(FrameError::Malformed("missing byte count"));
                }
                let byte_count = body.get_u8() as usize;
                if body.len() != byte_count {
                    return Err(FrameError::Malformed("byte count disagrees with payload"));
                }
                if code == function::READ_COILS {
                    Ok(Response::ReadCoils {
                        packed: body.to_vec(),
                    })
                } else {
                    if byte_count % 2 != 0 {
                        return Err(FrameError::Malformed("odd register byte count"));
                    }
                    let values = body.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
                    Ok(Response::ReadHoldingRegisters { values })
                }
            }
            function::WRITE_SINGLE_COIL | function::WRITE_SINGLE_REGISTER => {
                if body.len() != 4 {
                    return Err(FrameError::Malformed("write echo must be 4 bytes"));
                }
                let address = body.get_u16();
                let raw = body.get_u16();
                if code == function::WRITE_SINGLE_COIL {
                    let value = match raw {
                        COIL_ON => true,
                        COIL_OFF => false,
                        _ => return Err(FrameError::Malformed("coil echo must be 0xFF00 or 0x0000")),
                    };
                    Ok(Response::WriteSingleCoil { address, value })
                } else {
                    Ok(Response::WriteSingleRegister { address, value: raw })
                }
            }
            other => Err(FrameError::UnknownFunction(other)),
        }
    }
}

/// Pack booleans LSB-first into bytes (Modbus coil order)
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// Unpack the first `count` coil states from an LSB-first byte string
pub fn unpack_bits(packed: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| packed.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Encode a full ADU (header + PDU)
pub fn encode_adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: (pdu.len() + 1) as u16,
        unit_id,
    }
    .encode(&mut buf);
    buf.put_slice(pdu);
    buf
}

/// Read one ADU. A clean EOF before the first header byte is `Closed`.
pub async fn read_adu<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Adu, FrameError> {
    let mut raw = [0u8; MBAP_HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }
    let header = MbapHeader::decode(&raw)?;

    let mut pdu = vec![0u8; header.pdu_len()];
    reader.read_exact(&mut pdu).await?;
    Ok(Adu { header, pdu })
}

/// Write one ADU and flush
pub async fn write_adu<W: AsyncWrite + Unpin>(
    writer: &mut W,
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), FrameError> {
    let adu = encode_adu(transaction_id, unit_id, pdu);
    writer.write_all(&adu).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_coils_request_layout() {
        let pdu = Request::ReadCoils { start: 0, count: 15 }.encode();
        assert_eq!(pdu, vec![0x01, 0x00, 0x00, 0x00, 0x0F]);

        let adu = encode_adu(0x1234, 1, &pdu);
        assert_eq!(&adu[..7], &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01]);
    }

    #[test]
    fn test_write_coil_uses_ff00_encoding() {
        let pdu = Request::WriteSingleCoil {
            address: 10,
            value: true,
        }
        .encode();
        assert_eq!(pdu, vec![0x05, 0x00, 0x0A, 0xFF, 0x00]);
        assert_eq!(
            Request::decode(&pdu).unwrap(),
            Request::WriteSingleCoil {
                address: 10,
                value: true
            }
        );
    }

    #[test]
    fn test_write_coil_rejects_other_values() {
        let pdu = [0x05, 0x00, 0x01, 0x12, 0x34];
        assert!(matches!(Request::decode(&pdu), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_unknown_function_reported() {
        let pdu = [0x10, 0x00, 0x00, 0x00, 0x01];
        assert!(matches!(
            Request::decode(&pdu),
            Err(FrameError::UnknownFunction(0x10))
        ));
    }

    #[test]
    fn test_bit_packing_is_lsb_first() {
        let mut bits = vec![false; 15];
        bits[0] = true;
        bits[9] = true;
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_0001, 0b0000_0010]);
        assert_eq!(unpack_bits(&packed, 15), bits);
    }

    #[test]
    fn test_exception_response_decodes() {
        let pdu = Response::Exception {
            function: function::READ_COILS,
            code: exception::ILLEGAL_DATA_ADDRESS,
        }
        .encode();
        assert_eq!(pdu, vec![0x81, 0x02]);
        assert_eq!(
            Response::decode(&pdu).unwrap(),
            Response::Exception {
                function: 0x01,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_response_byte_count_must_match_payload() {
        // Claims 4 bytes of register data but carries 2
        let pdu = [0x03, 0x04, 0x00, 0x01];
        assert!(matches!(Response::decode(&pdu), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_header_rejects_nonzero_protocol() {
        let raw = [0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01];
        assert!(matches!(
            MbapHeader::decode(&raw),
            Err(FrameError::BadProtocolId(7))
        ));
    }

    #[test]
    fn test_header_rejects_oversized_length() {
        let raw = [0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01];
        assert!(matches!(
            MbapHeader::decode(&raw),
            Err(FrameError::BadLength(256))
        ));
    }

    #[tokio::test]
    async fn test_read_adu_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let pdu = Request::ReadHoldingRegisters { start: 2, count: 3 }.encode();
        write_adu(&mut a, 7, 1, &pdu).await.unwrap();

        let adu = read_adu(&mut b).await.unwrap();
        assert_eq!(adu.header.transaction_id, 7);
        assert_eq!(adu.header.unit_id, 1);
        assert_eq!(
            Request::decode(&adu.pdu).unwrap(),
            Request::ReadHoldingRegisters { start: 2, count: 3 }
        );

        drop(a);
        assert!(matches!(read_adu(&mut b).await, Err(FrameError::Closed)));
    }
}
