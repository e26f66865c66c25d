use super::super::{ensure_capacity, CommandId, FramingError, Request, Status};

/// `DAP_SWD_Configure`.
#[derive(Clone, Copy, Debug)]
pub struct ConfigureRequest {
    /// Turnaround period in clock cycles, 1 to 4.
    pub turnaround: u8,
    /// Generate a data phase on WAIT/FAULT acknowledges.
    pub data_phase: bool,
}

impl Default for ConfigureRequest {
    fn default() -> Self {
        Self {
            turnaround: 1,
            data_phase: false,
        }
    }
}

impl Request for ConfigureRequest {
    const COMMAND_ID: CommandId = CommandId::SwdConfigure;

    type Response = ConfigureResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, 1)?;
        let turnaround = self.turnaround.clamp(1, 4) - 1;
        buffer[0] = turnaround | ((self.data_phase as u8) << 2);
        Ok(1)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(ConfigureResponse(Status::from_byte(buffer[0])?))
    }
}

#[derive(Debug)]
pub struct ConfigureResponse(pub Status);
