//! `DAP_Transfer` and `DAP_TransferBlock`.
pub mod abort;
pub mod configure;
pub mod write_abort;

use scroll::{Pread, Pwrite, LE};

use super::{ensure_capacity, ensure_len, CommandId, FramingError, Request};

/// Which side of the debug interface a transfer addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Port {
    DebugPort,
    AccessPort,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RW {
    R = 1,
    W = 0,
}

/// One entry of a `DAP_Transfer` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InnerTransferRequest {
    pub port: Port,
    pub rw: RW,
    /// Register address bits A[3:2]; other bits are ignored.
    pub address: u8,
    pub data: Option<u32>,
}

impl InnerTransferRequest {
    fn request_byte(port: Port, rw: RW, address: u8) -> u8 {
        (port == Port::AccessPort) as u8 | (rw as u8) << 1 | (address & 0x0C)
    }

    fn encoded_len(&self) -> usize {
        if self.rw == RW::W {
            5
        } else {
            1
        }
    }

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, self.encoded_len())?;
        buffer[0] = Self::request_byte(self.port, self.rw, self.address);
        if let Some(data) = self.data {
            buffer[1..5].copy_from_slice(&data.to_le_bytes());
        }
        Ok(self.encoded_len())
    }
}

/// Acknowledge of the last transfer the probe executed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Ack {
    Ok = 1,
    Wait = 2,
    Fault = 4,
    #[allow(clippy::enum_variant_names)]
    NoAck = 7,
}

/// The status byte that follows the transfer count in both transfer responses.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TransferStatusByte {
    pub ack: Ack,
    /// SWD parity or protocol error.
    pub protocol_error: bool,
    pub value_mismatch: bool,
}

impl TransferStatusByte {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            ack: match byte & 0x7 {
                1 => Ack::Ok,
                2 => Ack::Wait,
                4 => Ack::Fault,
                _ => Ack::NoAck,
            },
            protocol_error: byte & 0x8 != 0,
            value_mismatch: byte & 0x10 != 0,
        }
    }

    /// Whether the whole request went through.
    pub fn is_ok(&self) -> bool {
        self.ack == Ack::Ok && !self.protocol_error && !self.value_mismatch
    }
}

/// Read or write several DP/AP registers in one frame.
///
/// The probe stops at the first transfer that does not complete. The response
/// then reports how many transfers completed and the acknowledge of the one
/// that failed, which is the transfer at index `transfer_count`.
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    /// Index of the DAP in the JTAG chain, ignored for SWD.
    pub dap_index: u8,
    transfers: Vec<InnerTransferRequest>,
}

/// Command ID, DAP index and transfer count.
pub const TRANSFER_REQUEST_HEADER: usize = 3;
/// Command ID, transfer count and status byte.
pub const TRANSFER_RESPONSE_HEADER: usize = 3;

impl TransferRequest {
    pub fn new(dap_index: u8) -> Self {
        Self {
            dap_index,
            transfers: Vec::new(),
        }
    }

    pub fn add_read(&mut self, port: Port, address: u8) {
        self.transfers.push(InnerTransferRequest {
            port,
            rw: RW::R,
            address,
            data: None,
        });
    }

    pub fn add_write(&mut self, port: Port, address: u8, value: u32) {
        self.transfers.push(InnerTransferRequest {
            port,
            rw: RW::W,
            address,
            data: Some(value),
        });
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn transfers(&self) -> &[InnerTransferRequest] {
        &self.transfers
    }

    /// Size of the command frame, including the command ID.
    pub fn request_size(&self) -> usize {
        TRANSFER_REQUEST_HEADER + self.transfers.iter().map(InnerTransferRequest::encoded_len).sum::<usize>()
    }

    /// Size of the response frame if every transfer completes.
    pub fn response_size(&self) -> usize {
        TRANSFER_RESPONSE_HEADER + 4 * self.transfers.iter().filter(|t| t.rw == RW::R).count()
    }
}

impl Request for TransferRequest {
    const COMMAND_ID: CommandId = CommandId::Transfer;
    const MIN_RESPONSE_LEN: usize = 2;

    type Response = TransferResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        if self.transfers.len() > u8::MAX as usize {
            return Err(FramingError::FrameTooLarge {
                size: self.request_size(),
                max: buffer.len() + 1,
            });
        }
        ensure_capacity(buffer, self.request_size() - 1)?;

        buffer[0] = self.dap_index;
        buffer[1] = self.transfers.len() as u8;
        let mut size = 2;
        for transfer in &self.transfers {
            size += transfer.to_bytes(&mut buffer[size..])?;
        }

        Ok(size)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        let transfer_count = buffer[0] as usize;
        if transfer_count > self.transfers.len() {
            tracing::error!("Transfer count larger than requested number of transfers");
            return Err(FramingError::UnexpectedAnswer);
        }
        let status = TransferStatusByte::from_byte(buffer[1]);

        let mut data = Vec::with_capacity(transfer_count);
        let mut offset = 2;
        for transfer in &self.transfers[..transfer_count] {
            if transfer.rw == RW::R {
                ensure_len(buffer, offset + 4)?;
                data.push(Some(buffer.pread_with::<u32>(offset, LE).map_err(|_| FramingError::UnexpectedAnswer)?));
                offset += 4;
            } else {
                data.push(None);
            }
        }

        Ok(TransferResponse {
            transfer_count,
            status,
            data,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct TransferResponse {
    /// Number of transfers that completed.
    pub transfer_count: usize,
    pub status: TransferStatusByte,
    /// One entry per completed transfer, `Some` for reads.
    pub data: Vec<Option<u32>>,
}

/// Repeatedly read or write a single register.
#[derive(Debug, Clone)]
pub struct TransferBlockRequest {
    pub dap_index: u8,
    port: Port,
    rw: RW,
    address: u8,
    transfer_count: u16,
    /// Values for writes.
    data: Vec<u32>,
}

/// Command ID, DAP index, count and request byte.
pub const BLOCK_REQUEST_HEADER: usize = 5;
/// Command ID, count and status byte.
pub const BLOCK_RESPONSE_HEADER: usize = 4;

impl TransferBlockRequest {
    pub fn read_request(dap_index: u8, port: Port, address: u8, count: u16) -> Self {
        Self {
            dap_index,
            port,
            rw: RW::R,
            address,
            transfer_count: count,
            data: Vec::new(),
        }
    }

    pub fn write_request(dap_index: u8, port: Port, address: u8, data: Vec<u32>) -> Self {
        Self {
            dap_index,
            port,
            rw: RW::W,
            address,
            transfer_count: data.len().min(u16::MAX as usize) as u16,
            data,
        }
    }

    /// Largest number of words per frame for the given packet size, in either direction.
    pub fn max_words(packet_size: usize) -> usize {
        (packet_size.saturating_sub(BLOCK_REQUEST_HEADER) / 4).min(u16::MAX as usize)
    }
}

impl Request for TransferBlockRequest {
    const COMMAND_ID: CommandId = CommandId::TransferBlock;
    const MIN_RESPONSE_LEN: usize = 3;

    type Response = TransferBlockResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        let size = BLOCK_REQUEST_HEADER - 1 + 4 * self.data.len();
        ensure_capacity(buffer, size)?;

        buffer[0] = self.dap_index;
        buffer
            .pwrite_with(self.transfer_count, 1, LE)
            .map_err(|_| FramingError::UnexpectedAnswer)?;
        buffer[3] = InnerTransferRequest::request_byte(self.port, self.rw, self.address);

        for (i, word) in self.data.iter().enumerate() {
            buffer
                .pwrite_with(*word, 4 + 4 * i, LE)
                .map_err(|_| FramingError::UnexpectedAnswer)?;
        }

        Ok(size)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        let transfer_count: u16 = buffer.pread_with(0, LE).map_err(|_| FramingError::UnexpectedAnswer)?;
        if transfer_count > self.transfer_count {
            return Err(FramingError::UnexpectedAnswer);
        }
        let status = TransferStatusByte::from_byte(buffer[2]);

        let mut data = Vec::new();
        if self.rw == RW::R {
            ensure_len(buffer, 3 + 4 * transfer_count as usize)?;
            for i in 0..transfer_count as usize {
                data.push(
                    buffer
                        .pread_with::<u32>(3 + 4 * i, LE)
                        .map_err(|_| FramingError::UnexpectedAnswer)?,
                );
            }
        }

        Ok(TransferBlockResponse {
            transfer_count,
            status,
            data,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct TransferBlockResponse {
    pub transfer_count: u16,
    pub status: TransferStatusByte,
    /// Words read, empty for writes.
    pub data: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::cmsisdap::commands::{decode, encode};

    #[test]
    fn dp_write_then_ap_read() {
        let mut request = TransferRequest::new(0);
        request.add_write(Port::DebugPort, 0x8, 0x0100_00F0);
        request.add_read(Port::AccessPort, 0xC);

        let frame = encode(&request, 64).unwrap();
        assert_eq!(frame, vec![0x05, 0x00, 0x02, 0x08, 0xF0, 0x00, 0x00, 0x01, 0x0F]);
        assert_eq!(request.request_size(), frame.len());
        assert_eq!(request.response_size(), 7);
    }

    #[test]
    fn completed_reads_carry_data() {
        let mut request = TransferRequest::new(0);
        request.add_write(Port::DebugPort, 0x8, 0);
        request.add_read(Port::DebugPort, 0x0);

        let response = decode(&request, &[0x05, 2, 0x01, 0x77, 0x14, 0xA0, 0x2B]).unwrap();
        assert_eq!(response.transfer_count, 2);
        assert!(response.status.is_ok());
        assert_eq!(response.data, vec![None, Some(0x2BA0_1477)]);
    }

    #[test]
    fn failure_stops_before_the_failing_transfer() {
        let mut request = TransferRequest::new(0);
        request.add_read(Port::AccessPort, 0x0);
        request.add_read(Port::AccessPort, 0x4);

        let response = decode(&request, &[0x05, 1, 0x04, 1, 0, 0, 0]).unwrap();
        assert_eq!(response.transfer_count, 1);
        assert_eq!(response.status.ack, Ack::Fault);
        assert_eq!(response.data, vec![Some(1)]);
    }

    #[test]
    fn count_larger_than_request_is_rejected() {
        let mut request = TransferRequest::new(0);
        request.add_write(Port::DebugPort, 0x4, 0);
        assert_eq!(
            decode(&request, &[0x05, 2, 0x01]).unwrap_err(),
            FramingError::UnexpectedAnswer
        );
    }

    #[test]
    fn missing_read_data_is_too_short() {
        let mut request = TransferRequest::new(0);
        request.add_read(Port::DebugPort, 0x0);
        assert!(matches!(
            decode(&request, &[0x05, 1, 0x01, 0xAA]).unwrap_err(),
            FramingError::TooShort { .. }
        ));
    }

    #[test_case(0x01, Ack::Ok, false; "ok")]
    #[test_case(0x02, Ack::Wait, false; "wait")]
    #[test_case(0x04, Ack::Fault, false; "fault")]
    #[test_case(0x07, Ack::NoAck, false; "no ack")]
    #[test_case(0x08, Ack::NoAck, true; "parity")]
    fn status_byte(byte: u8, ack: Ack, protocol_error: bool) {
        let status = TransferStatusByte::from_byte(byte);
        assert_eq!(status.ack, ack);
        assert_eq!(status.protocol_error, protocol_error);
    }

    #[test]
    fn block_read_round_trip() {
        let request = TransferBlockRequest::read_request(0, Port::AccessPort, 0xC, 2);
        assert_eq!(encode(&request, 64).unwrap(), vec![0x06, 0x00, 0x02, 0x00, 0x0F]);

        let response = decode(&request, &[0x06, 2, 0, 0x01, 1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        assert_eq!(response.data, vec![1, 2]);
    }

    #[test]
    fn block_write_layout() {
        let request = TransferBlockRequest::write_request(0, Port::AccessPort, 0xC, vec![0x1122_3344]);
        assert_eq!(
            encode(&request, 64).unwrap(),
            vec![0x06, 0x00, 0x01, 0x00, 0x0D, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(TransferBlockRequest::max_words(64), 14);
    }
}
