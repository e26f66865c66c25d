//! `DAP_JTAG_Sequence`: TMS level plus up to 64 TDI bits per sequence.
use bitvec::prelude::*;

use super::super::{ensure_capacity, ensure_len, CmsisDapError, CommandId, FramingError, Request, Status};

#[derive(Clone, Copy, Debug)]
pub struct Sequence {
    /// 1 to 64 clock cycles.
    tck_cycles: u8,
    tms: bool,
    tdo_capture: bool,
    data: [u8; 8],
}

impl Sequence {
    pub fn capture(tms: bool, tdi: &BitSlice<u8>) -> Result<Self, CmsisDapError> {
        Self::new(tms, tdi, true)
    }

    pub fn no_capture(tms: bool, tdi: &BitSlice<u8>) -> Result<Self, CmsisDapError> {
        Self::new(tms, tdi, false)
    }

    fn new(tms: bool, tdi: &BitSlice<u8>, tdo_capture: bool) -> Result<Self, CmsisDapError> {
        if tdi.is_empty() || tdi.len() > 64 {
            return Err(CmsisDapError::TooMuchData);
        }

        let mut data = [0u8; 8];
        data.view_bits_mut::<Lsb0>()[..tdi.len()].copy_from_bitslice(tdi);

        Ok(Self {
            tck_cycles: tdi.len() as u8,
            tms,
            tdo_capture,
            data,
        })
    }

    fn byte_len(&self) -> usize {
        (self.tck_cycles as usize).div_ceil(8)
    }

    fn info(&self) -> u8 {
        // 64 cycles are encoded as zero.
        (self.tck_cycles & 0x3F) | ((self.tms as u8) << 6) | ((self.tdo_capture as u8) << 7)
    }
}

#[derive(Clone, Debug)]
pub struct SequenceRequest {
    sequences: Vec<Sequence>,
}

impl SequenceRequest {
    pub fn new(sequences: Vec<Sequence>) -> Result<Self, CmsisDapError> {
        if sequences.is_empty() || sequences.len() > u8::MAX as usize {
            return Err(CmsisDapError::TooMuchData);
        }
        Ok(SequenceRequest { sequences })
    }
}

impl Request for SequenceRequest {
    const COMMAND_ID: CommandId = CommandId::JtagSequence;

    type Response = SequenceResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        let size = 1 + self.sequences.iter().map(|s| 1 + s.byte_len()).sum::<usize>();
        ensure_capacity(buffer, size)?;

        buffer[0] = self.sequences.len() as u8;
        let mut offset = 1;
        for sequence in &self.sequences {
            buffer[offset] = sequence.info();
            offset += 1;
            let len = sequence.byte_len();
            buffer[offset..offset + len].copy_from_slice(&sequence.data[..len]);
            offset += len;
        }

        Ok(offset)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        let status = Status::from_byte(buffer[0])?;
        if status == Status::DapError {
            return Ok(SequenceResponse(status, Vec::new()));
        }

        let tdo_len: usize = self
            .sequences
            .iter()
            .filter(|s| s.tdo_capture)
            .map(Sequence::byte_len)
            .sum();
        ensure_len(buffer, 1 + tdo_len)?;

        Ok(SequenceResponse(status, buffer[1..1 + tdo_len].to_vec()))
    }
}

/// Status and the captured TDO bytes, one group per capturing sequence.
#[derive(Debug)]
pub struct SequenceResponse(pub Status, pub Vec<u8>);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cmsisdap::commands::encode;

    #[test]
    fn tms_high_reset_sequence() {
        let request = SequenceRequest::new(vec![Sequence::no_capture(true, &bitvec![u8, Lsb0; 0; 6]).unwrap()]).unwrap();
        assert_eq!(encode(&request, 64).unwrap(), vec![0x14, 1, 0x46, 0x00]);
    }

    #[test]
    fn sixty_four_cycles_encode_as_zero() {
        let request = SequenceRequest::new(vec![Sequence::capture(false, &bitvec![u8, Lsb0; 1; 64]).unwrap()]).unwrap();
        let frame = encode(&request, 64).unwrap();
        assert_eq!(frame[2], 0x80);
        assert_eq!(&frame[3..], &[0xFF; 8]);

        let response = request.parse_response(&[0, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(response.1, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn empty_or_oversized_sequences_are_rejected() {
        assert!(Sequence::no_capture(false, &bitvec![u8, Lsb0; 0; 65]).is_err());
        assert!(Sequence::no_capture(false, BitSlice::empty()).is_err());
    }
}
