//! `DAP_Info` queries.
use scroll::{Pread, LE};

use super::super::{ensure_len, CommandId, FramingError, Request};

macro_rules! info_command {
    ($id:expr, $name:ident, $response_type:ty) => {
        #[derive(Clone, Default, Debug)]
        pub struct $name {}

        impl Request for $name {
            const COMMAND_ID: CommandId = CommandId::Info;

            type Response = $response_type;

            fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
                super::super::ensure_capacity(buffer, 1)?;
                buffer[0] = $id;
                Ok(1)
            }

            fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
                ParseFromResponse::from_response(buffer)
            }
        }
    };
}

info_command!(0x01, VendorCommand, Option<String>);
info_command!(0x02, ProductIdCommand, Option<String>);
info_command!(0x03, SerialNumberCommand, Option<String>);
info_command!(0x04, ProtocolVersionCommand, Option<String>);
info_command!(0x05, TargetDeviceVendorCommand, Option<String>);
info_command!(0x06, TargetDeviceNameCommand, Option<String>);
info_command!(0x07, TargetBoardVendorCommand, Option<String>);
info_command!(0x08, TargetBoardNameCommand, Option<String>);
info_command!(0x09, ProductFirmwareVersionCommand, Option<String>);

info_command!(0xF0, CapabilitiesCommand, Capabilities);
info_command!(0xFD, SWOTraceBufferSizeCommand, u32);
info_command!(0xFE, PacketCountCommand, u8);
info_command!(0xFF, PacketSizeCommand, u16);

trait ParseFromResponse: Sized {
    fn from_response(buffer: &[u8]) -> Result<Self, FramingError>;
}

impl ParseFromResponse for Option<String> {
    /// The first byte is the string length including its zero terminator;
    /// zero means the probe has no value for this ID.
    fn from_response(buffer: &[u8]) -> Result<Self, FramingError> {
        let string_len = buffer[0] as usize;

        match string_len {
            0 => Ok(None),
            n => {
                ensure_len(buffer, 1 + n)?;
                let res = std::str::from_utf8(&buffer[1..1 + n])?;
                Ok(Some(res.trim_end_matches('\0').to_owned()))
            }
        }
    }
}

fn parse_number<'a, T>(buffer: &'a [u8]) -> Result<T, FramingError>
where
    T: scroll::ctx::TryFromCtx<'a, scroll::Endian, Error = scroll::Error>,
{
    let size = std::mem::size_of::<T>();
    if buffer[0] as usize != size {
        return Err(FramingError::UnexpectedAnswer);
    }
    ensure_len(buffer, 1 + size)?;
    buffer.pread_with(1, LE).map_err(|_| FramingError::UnexpectedAnswer)
}

impl ParseFromResponse for u8 {
    fn from_response(buffer: &[u8]) -> Result<Self, FramingError> {
        parse_number(buffer)
    }
}

impl ParseFromResponse for u16 {
    fn from_response(buffer: &[u8]) -> Result<Self, FramingError> {
        parse_number(buffer)
    }
}

impl ParseFromResponse for u32 {
    fn from_response(buffer: &[u8]) -> Result<Self, FramingError> {
        parse_number(buffer)
    }
}

/// The capability bitmap reported for info ID `0xF0`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub swd_implemented: bool,
    pub jtag_implemented: bool,
    pub swo_uart_implemented: bool,
    pub swo_manchester_implemented: bool,
    pub atomic_commands_implemented: bool,
    pub test_domain_timer_implemented: bool,
    pub swo_streaming_trace_implemented: bool,
    pub uart_communication_port_implemented: bool,
    pub uart_com_port_implemented: bool,
    /// Both info bytes as received, byte 0 in the low half.
    pub raw: u16,
}

impl ParseFromResponse for Capabilities {
    fn from_response(buffer: &[u8]) -> Result<Self, FramingError> {
        let len = buffer[0] as usize;
        if len == 0 {
            return Err(FramingError::UnexpectedAnswer);
        }
        ensure_len(buffer, 1 + len)?;

        let first = buffer[1];
        let second = if len >= 2 { buffer[2] } else { 0 };

        Ok(Capabilities {
            swd_implemented: first & 0x01 != 0,
            jtag_implemented: first & 0x02 != 0,
            swo_uart_implemented: first & 0x04 != 0,
            swo_manchester_implemented: first & 0x08 != 0,
            atomic_commands_implemented: first & 0x10 != 0,
            test_domain_timer_implemented: first & 0x20 != 0,
            swo_streaming_trace_implemented: first & 0x40 != 0,
            uart_communication_port_implemented: first & 0x80 != 0,
            uart_com_port_implemented: second & 0x01 != 0,
            raw: u16::from_le_bytes([first, second]),
        })
    }
}
