use super::super::{ensure_len, CommandId, FramingError, Request, Status};

/// `DAP_ResetTarget`: run the probe's device specific reset sequence.
#[derive(Clone, Copy, Debug)]
pub struct ResetRequest;

impl Request for ResetRequest {
    const COMMAND_ID: CommandId = CommandId::ResetTarget;
    const MIN_RESPONSE_LEN: usize = 2;

    type Response = ResetResponse;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, FramingError> {
        Ok(0)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        ensure_len(buffer, 2)?;
        Ok(ResetResponse {
            status: Status::from_byte(buffer[0])?,
            execute: match buffer[1] {
                0 => Execute::NoDeviceSpecificResetSequenceImplemented,
                1 => Execute::DeviceSpecificResetSequenceImplemented,
                _ => return Err(FramingError::UnexpectedAnswer),
            },
        })
    }
}

/// Whether the probe actually ran a device specific sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execute {
    NoDeviceSpecificResetSequenceImplemented = 0,
    DeviceSpecificResetSequenceImplemented = 1,
}

#[derive(Debug)]
pub struct ResetResponse {
    pub status: Status,
    pub execute: Execute,
}
