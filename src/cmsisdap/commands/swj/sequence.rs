//! `DAP_SWJ_Sequence`: clock raw bits out on SWDIO/TMS, LSB first.
use super::super::{ensure_capacity, CmsisDapError, CommandId, FramingError, Request, Status};

const MAX_SEQUENCE_BYTES: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct SequenceRequest {
    /// Number of bits; zero encodes 256.
    bit_count: u8,
    data: [u8; MAX_SEQUENCE_BYTES],
}

impl SequenceRequest {
    /// A sequence of `bit_len` bits taken from `data`; `bit_len` of zero sends all 256.
    pub fn new(data: &[u8], bit_len: u8) -> Result<SequenceRequest, CmsisDapError> {
        let needed = Self::byte_len(bit_len);
        if data.len() > MAX_SEQUENCE_BYTES || data.len() < needed {
            return Err(CmsisDapError::TooMuchData);
        }

        let mut owned = [0u8; MAX_SEQUENCE_BYTES];
        owned[..needed].copy_from_slice(&data[..needed]);

        Ok(SequenceRequest {
            bit_count: bit_len,
            data: owned,
        })
    }

    pub fn bit_len(&self) -> usize {
        match self.bit_count {
            0 => 256,
            n => n as usize,
        }
    }

    fn byte_len(bit_count: u8) -> usize {
        match bit_count {
            0 => MAX_SEQUENCE_BYTES,
            n => (n as usize).div_ceil(8),
        }
    }
}

impl Request for SequenceRequest {
    const COMMAND_ID: CommandId = CommandId::SwjSequence;

    type Response = SequenceResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        let len = Self::byte_len(self.bit_count);
        ensure_capacity(buffer, 1 + len)?;
        buffer[0] = self.bit_count;
        buffer[1..1 + len].copy_from_slice(&self.data[..len]);
        Ok(1 + len)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(SequenceResponse(Status::from_byte(buffer[0])?))
    }
}

#[derive(Debug)]
pub struct SequenceResponse(pub Status);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cmsisdap::commands::encode;

    #[test]
    fn partial_byte_is_rounded_up() {
        let data = 0xE79Eu64.to_le_bytes();
        let request = SequenceRequest::new(&data, 16).unwrap();
        assert_eq!(encode(&request, 64).unwrap(), vec![0x12, 16, 0x9E, 0xE7]);

        let request = SequenceRequest::new(&data, 12).unwrap();
        assert_eq!(encode(&request, 64).unwrap(), vec![0x12, 12, 0x9E, 0xE7]);
    }

    #[test]
    fn zero_bit_count_sends_256_bits() {
        let request = SequenceRequest::new(&[0xFF; 32], 0).unwrap();
        assert_eq!(request.bit_len(), 256);
        assert_eq!(encode(&request, 64).unwrap().len(), 34);
    }

    #[test]
    fn data_shorter_than_bit_count_is_rejected() {
        assert!(matches!(
            SequenceRequest::new(&[0xFF], 16),
            Err(CmsisDapError::TooMuchData)
        ));
    }
}
