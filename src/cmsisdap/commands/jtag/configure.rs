use super::super::{ensure_capacity, CmsisDapError, CommandId, FramingError, Request, Status};

/// `DAP_JTAG_Configure`: IR length of every TAP in the chain, TDI side first.
#[derive(Clone, Debug)]
pub struct ConfigureRequest {
    ir_lengths: Vec<u8>,
}

impl ConfigureRequest {
    pub fn new(ir_lengths: Vec<u8>) -> Result<ConfigureRequest, CmsisDapError> {
        if ir_lengths.is_empty() || ir_lengths.len() > u8::MAX as usize {
            return Err(CmsisDapError::TooMuchData);
        }
        Ok(ConfigureRequest { ir_lengths })
    }
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::JtagConfigure;

    type Response = ConfigureResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, 1 + self.ir_lengths.len())?;
        buffer[0] = self.ir_lengths.len() as u8;
        buffer[1..=self.ir_lengths.len()].copy_from_slice(&self.ir_lengths);
        Ok(self.ir_lengths.len() + 1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(ConfigureResponse(Status::from_byte(buffer[0])?))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConfigureResponse(pub Status);
