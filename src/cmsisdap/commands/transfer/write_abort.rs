use super::super::{ensure_capacity, CommandId, FramingError, Request, Status};

/// `DAP_WriteABORT`: write the DP ABORT register outside of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteAbortRequest {
    pub dap_index: u8,
    pub abort: u32,
}

impl Request for WriteAbortRequest {
    const COMMAND_ID: CommandId = CommandId::WriteAbort;

    type Response = WriteAbortResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, 5)?;
        buffer[0] = self.dap_index;
        buffer[1..5].copy_from_slice(&self.abort.to_le_bytes());
        Ok(5)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(WriteAbortResponse(Status::from_byte(buffer[0])?))
    }
}

#[derive(Debug)]
pub struct WriteAbortResponse(pub Status);
