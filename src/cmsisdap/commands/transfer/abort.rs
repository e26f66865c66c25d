use super::super::{CommandId, FramingError, Request};

/// `DAP_TransferAbort`: stop a transfer the probe is still retrying.
///
/// The probe never answers this command.
#[derive(Clone, Copy, Debug)]
pub struct TransferAbortRequest;

impl Request for TransferAbortRequest {
    const COMMAND_ID: CommandId = CommandId::TransferAbort;
    const MIN_RESPONSE_LEN: usize = 0;
    const EXPECTS_RESPONSE: bool = false;

    type Response = ();

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, FramingError> {
        Ok(0)
    }

    fn parse_response(&self, _buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(())
    }
}
