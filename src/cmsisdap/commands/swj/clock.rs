use scroll::{Pwrite, LE};

use super::super::{CommandId, FramingError, Request, Status};

#[derive(Clone, Copy, Debug)]
pub struct SWJClockRequest {
    pub clock_speed_hz: u32,
}

impl Request for SWJClockRequest {
    const COMMAND_ID: CommandId = CommandId::SwjClock;

    type Response = SWJClockResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        super::super::ensure_capacity(buffer, 4)?;
        buffer
            .pwrite_with(self.clock_speed_hz, 0, LE)
            .map_err(|_| FramingError::UnexpectedAnswer)?;
        Ok(4)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(SWJClockResponse {
            status: Status::from_byte(buffer[0])?,
        })
    }
}

#[derive(Debug)]
pub struct SWJClockResponse {
    pub status: Status,
}
