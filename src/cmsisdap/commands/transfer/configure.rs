use scroll::{Pwrite, LE};

use super::super::{ensure_capacity, CommandId, FramingError, Request, Status};

/// `DAP_TransferConfigure`: parameters for both transfer commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigureRequest {
    /// Extra idle cycles after each transfer.
    pub idle_cycles: u8,
    /// Retries the probe itself performs after a WAIT.
    pub wait_retry: u16,
    /// Retries on reads with value match.
    pub match_retry: u16,
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::TransferConfigure;

    type Response = ConfigureResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, 5)?;
        buffer[0] = self.idle_cycles;
        buffer
            .pwrite_with(self.wait_retry, 1, LE)
            .map_err(|_| FramingError::UnexpectedAnswer)?;
        buffer
            .pwrite_with(self.match_retry, 3, LE)
            .map_err(|_| FramingError::UnexpectedAnswer)?;
        Ok(5)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(ConfigureResponse(Status::from_byte(buffer[0])?))
    }
}

#[derive(Debug)]
pub struct ConfigureResponse(pub Status);
