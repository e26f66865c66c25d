//! CMSIS-DAP command frames and the byte pipes that carry them.
//!
//! Every command is a [`Request`] that knows its command ID, how to lay out its
//! payload and how to parse the payload of the matching response. [`encode`]
//! and [`decode`] are pure; [`send_command`] couples them with a [`Transport`].
pub mod general;
pub mod jtag;
pub mod swd;
pub mod swj;
pub mod transfer;
pub mod vendor;

use std::io;
use std::str::Utf8Error;
use std::time::Duration;

use async_io::{block_on, Timer};
use futures_lite::FutureExt;
use nusb::transfer::{RequestBuffer, TransferError};

use crate::cmsisdap::WireProtocol;
use general::info::PacketSizeCommand;

#[derive(Debug, thiserror::Error)]
pub enum CmsisDapError {
    #[error("Error handling CMSIS-DAP command {command_id:?}")]
    Send {
        command_id: CommandId,
        #[source]
        source: SendError,
    },
    #[error("CMSIS-DAP responded with an error")]
    ErrorResponse(#[source] RequestError),
    #[error("Too much data provided for a sequence command")]
    TooMuchData,
    #[error("Could not determine a suitable packet size for this probe")]
    NoPacketSize,
}

impl CmsisDapError {
    /// The underlying [`SendError`], if the failure happened on the wire.
    pub fn send_error(&self) -> Option<&SendError> {
        match self {
            CmsisDapError::Send { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A request the probe answered with `DAP_ERROR`.
#[derive(Debug, docsplay::Display)]
pub enum RequestError {
    /// Setting the SWJ clock failed: {request:?}
    SwjClock { request: swj::clock::SWJClockRequest },
    /// Sending an SWJ sequence failed: {request:?}
    SwjSequence { request: swj::sequence::SequenceRequest },
    /// Configuring transfers failed: {request:?}
    TransferConfigure { request: transfer::configure::ConfigureRequest },
    /// Configuring SWD failed: {request:?}
    SwdConfigure { request: swd::configure::ConfigureRequest },
    /// Configuring the JTAG chain failed: {request:?}
    JtagConfigure { request: jtag::configure::ConfigureRequest },
    /// Sending a JTAG sequence failed: {request:?}
    JtagSequence { request: jtag::sequence::SequenceRequest },
    /// Initializing the debug port failed for protocol {protocol:?}
    InitFailed { protocol: Option<WireProtocol> },
    /// Disconnecting from the target failed.
    Disconnect,
    /// Writing the ABORT register failed: {request:?}
    WriteAbort { request: transfer::write_abort::WriteAbortRequest },
    /// Resetting the target failed.
    ResetTarget,
}

impl std::error::Error for RequestError {}

/// Failures of the byte pipe itself.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Error in the USB HID access")]
    HidApi(#[from] hidapi::HidError),
    #[error("Error in the USB access")]
    Usb(#[source] io::Error),
    #[error("The probe was disconnected")]
    Disconnected,
}

/// A response that cannot belong to the request that was sent.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Response too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Command ID in response ({received:#04x}) does not match sent command ID ({expected:#04x})")]
    CommandIdMismatch { expected: u8, received: u8 },
    #[error("Status can only be 0x00 or 0xFF, got {0:#04x}")]
    InvalidResponseStatus(u8),
    #[error("Connecting to target failed, received: {0:#x}")]
    ConnectResponseError(u8),
    #[error("Frame of {size} bytes does not fit in a {max} byte packet")]
    FrameTooLarge { size: usize, max: usize },
    /// CMSIS-DAP requires strings to be UTF-8.
    #[error("String in response is not valid UTF-8")]
    InvalidString(#[from] Utf8Error),
    #[error("Unexpected answer to command")]
    UnexpectedAnswer,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Timeout in USB communication")]
    Timeout,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// A request/response byte pipe to a probe.
///
/// Implementations deliver exactly one command frame per `write` and return
/// one response frame per `read`. HID report IDs and padding are the
/// implementation's business, frames never contain them.
pub trait Transport {
    fn write(&mut self, frame: &[u8]) -> Result<(), SendError>;

    /// Read one response frame into `buf`, returning its length.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SendError>;

    /// Drop anything the probe still has queued for us.
    fn drain(&mut self);

    /// Maximum frame size currently in use.
    fn packet_size(&self) -> usize;

    fn set_packet_size(&mut self, packet_size: usize);
}

pub enum CmsisDapDevice {
    /// CMSIS-DAP v1 over HID.
    V1 {
        handle: hidapi::HidDevice,
        report_size: usize,
    },

    /// CMSIS-DAP v2 over bulk endpoints.
    V2 {
        handle: nusb::Interface,
        out_ep: u8,
        in_ep: u8,
        max_packet_size: usize,
    },
}

impl Transport for CmsisDapDevice {
    fn write(&mut self, frame: &[u8]) -> Result<(), SendError> {
        match self {
            CmsisDapDevice::V1 { handle, report_size } => {
                // HID needs the report ID up front and always a full report.
                let mut report = vec![0u8; *report_size + 1];
                let len = frame.len().min(*report_size);
                report[1..1 + len].copy_from_slice(&frame[..len]);
                handle.write(&report).map_err(TransportError::from)?;
                Ok(())
            }
            CmsisDapDevice::V2 { handle, out_ep, .. } => {
                let out = frame.to_vec();
                let fut = async {
                    let comp = handle.bulk_out(*out_ep, out).await;
                    comp.status.map_err(usb_error)?;
                    Ok::<(), SendError>(())
                };
                block_on(fut.or(async {
                    Timer::after(BULK_WRITE_TIMEOUT).await;
                    Err(SendError::Timeout)
                }))
            }
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SendError> {
        match self {
            CmsisDapDevice::V1 { handle, .. } => {
                let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
                // hidapi reports a timeout as a zero-length read.
                match handle.read_timeout(buf, millis).map_err(TransportError::from)? {
                    0 => Err(SendError::Timeout),
                    n => Ok(n),
                }
            }
            CmsisDapDevice::V2 { handle, in_ep, .. } => {
                let mut queue = handle.bulk_in_queue(*in_ep);
                queue.submit(RequestBuffer::new(buf.len()));
                let completion = block_on(
                    async { Some(queue.next_complete().await) }.or(async {
                        Timer::after(timeout).await;
                        None
                    }),
                );
                let Some(comp) = completion else {
                    queue.cancel_all();
                    let _ = block_on(queue.next_complete());
                    return Err(SendError::Timeout);
                };
                comp.status.map_err(usb_error)?;
                let n = comp.data.len().min(buf.len());
                buf[..n].copy_from_slice(&comp.data[..n]);
                Ok(n)
            }
        }
    }

    fn drain(&mut self) {
        tracing::debug!("Draining probe of any pending data.");
        let mut discard = vec![0u8; self.packet_size() + 1];
        for _ in 0..MAX_DRAIN_READS {
            match self.read(&mut discard, Duration::from_millis(1)) {
                Ok(n) if n != 0 => continue,
                _ => break,
            }
        }
    }

    fn packet_size(&self) -> usize {
        match self {
            CmsisDapDevice::V1 { report_size, .. } => *report_size,
            CmsisDapDevice::V2 { max_packet_size, .. } => *max_packet_size,
        }
    }

    fn set_packet_size(&mut self, packet_size: usize) {
        tracing::debug!("Configuring probe to use packet size {}", packet_size);
        match self {
            CmsisDapDevice::V1 { report_size, .. } => *report_size = packet_size,
            CmsisDapDevice::V2 { max_packet_size, .. } => *max_packet_size = packet_size,
        }
    }
}

const BULK_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
const MAX_DRAIN_READS: usize = 64;

fn usb_error(error: TransferError) -> SendError {
    match error {
        TransferError::Disconnected => TransportError::Disconnected.into(),
        other => TransportError::Usb(io::Error::other(other)).into(),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    DapOk = 0x00,
    DapError = 0xFF,
}

impl Status {
    pub fn from_byte(value: u8) -> Result<Self, FramingError> {
        match value {
            0x00 => Ok(Status::DapOk),
            0xFF => Ok(Status::DapError),
            other => Err(FramingError::InvalidResponseStatus(other)),
        }
    }
}

/// Command ID for CMSIS-DAP commands.
///
/// The command ID is always sent as the first byte for every command,
/// and also is the first byte of every response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandId {
    Info = 0x00,
    HostStatus = 0x01,
    Connect = 0x02,
    Disconnect = 0x03,
    TransferConfigure = 0x04,
    Transfer = 0x05,
    TransferBlock = 0x06,
    TransferAbort = 0x07,
    WriteAbort = 0x08,
    ResetTarget = 0x0A,
    SwjPins = 0x10,
    SwjClock = 0x11,
    SwjSequence = 0x12,
    SwdConfigure = 0x13,
    JtagSequence = 0x14,
    JtagConfigure = 0x15,
    EnterBootloader = 0x80,
    BootloaderHandshake = 0x81,
    FirmwareChunk = 0x82,
    FirmwareChecksum = 0x83,
    BootloaderReboot = 0x84,
}

pub trait Request {
    const COMMAND_ID: CommandId;

    /// Smallest response payload, not counting the echoed command ID.
    const MIN_RESPONSE_LEN: usize = 1;

    /// `DAP_TransferAbort` is the only command the probe never answers.
    const EXPECTS_RESPONSE: bool = true;

    type Response;

    /// Write the payload (everything after the command ID) into `buffer`,
    /// returning the number of bytes written.
    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError>;

    /// Parse the payload of a response (everything after the echoed command ID).
    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError>;
}

/// Fail with [`FramingError::FrameTooLarge`] unless `buffer` can take `needed` payload bytes.
pub(crate) fn ensure_capacity(buffer: &[u8], needed: usize) -> Result<(), FramingError> {
    if buffer.len() < needed {
        Err(FramingError::FrameTooLarge {
            size: needed + 1,
            max: buffer.len() + 1,
        })
    } else {
        Ok(())
    }
}

/// Fail with [`FramingError::TooShort`] unless `buffer` holds `needed` payload bytes.
pub(crate) fn ensure_len(buffer: &[u8], needed: usize) -> Result<(), FramingError> {
    if buffer.len() < needed {
        Err(FramingError::TooShort {
            expected: needed + 1,
            actual: buffer.len() + 1,
        })
    } else {
        Ok(())
    }
}

/// Encode `request` as a command frame no larger than `packet_size`.
pub fn encode<R: Request>(request: &R, packet_size: usize) -> Result<Vec<u8>, FramingError> {
    if packet_size == 0 {
        return Err(FramingError::FrameTooLarge { size: 1, max: 0 });
    }
    let mut frame = vec![0u8; packet_size];
    frame[0] = R::COMMAND_ID as u8;
    let size = request.to_bytes(&mut frame[1..])? + 1;
    frame.truncate(size);
    Ok(frame)
}

/// Decode the response frame answering `request`.
pub fn decode<R: Request>(request: &R, frame: &[u8]) -> Result<R::Response, FramingError> {
    let Some((&command_id, payload)) = frame.split_first() else {
        return Err(FramingError::TooShort {
            expected: R::MIN_RESPONSE_LEN + 1,
            actual: 0,
        });
    };
    if command_id != R::COMMAND_ID as u8 {
        return Err(FramingError::CommandIdMismatch {
            expected: R::COMMAND_ID as u8,
            received: command_id,
        });
    }
    ensure_len(payload, R::MIN_RESPONSE_LEN)?;
    request.parse_response(payload)
}

pub fn send_command<Req: Request>(
    device: &mut dyn Transport,
    request: &Req,
    timeout: Duration,
) -> Result<Req::Response, CmsisDapError> {
    send_command_inner(device, request, timeout).map_err(|source| CmsisDapError::Send {
        command_id: Req::COMMAND_ID,
        source,
    })
}

fn send_command_inner<Req: Request>(
    device: &mut dyn Transport,
    request: &Req,
    timeout: Duration,
) -> Result<Req::Response, SendError> {
    let frame = encode(request, device.packet_size())?;
    trace_buffer("Transmit buffer", &frame);
    device.write(&frame)?;

    if !Req::EXPECTS_RESPONSE {
        // Nothing comes back, so the payload parser sees an empty response.
        return Ok(request.parse_response(&[])?);
    }

    let mut buffer = vec![0u8; device.packet_size().max(64)];
    let len = device.read(&mut buffer, timeout)?;
    let response = &buffer[..len];
    trace_buffer("Receive buffer", response);

    Ok(decode(request, response)?)
}

/// Ask the probe for its packet size and switch the transport to it.
///
/// Some probes only answer once they received a full packet worth of data,
/// which we cannot know up front, so timeouts are retried a few times.
pub fn find_packet_size(device: &mut dyn Transport, timeout: Duration) -> Result<usize, CmsisDapError> {
    for attempt in 0..16 {
        tracing::debug!("Attempt {} to find packet size", attempt + 1);
        match send_command(device, &PacketSizeCommand {}, timeout) {
            Ok(size) => {
                tracing::debug!("Success: packet size is {}", size);
                device.set_packet_size(size as usize);
                return Ok(size as usize);
            }
            Err(CmsisDapError::Send {
                source: SendError::Timeout,
                ..
            }) => (),
            Err(e) => return Err(e),
        }
    }

    Err(CmsisDapError::NoPacketSize)
}

/// SWD parity bit for `value`: set when it holds an odd number of ones.
pub fn parity(value: u32) -> bool {
    value.count_ones() % 2 == 1
}

/// Trace log a buffer, cutting everything after the first trailing zero.
fn trace_buffer(name: &str, buf: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let len = buf.len();
        let cut = len + 1 - buf.iter().rev().position(|&x| x != 0).unwrap_or(len);
        let end = std::cmp::min(len, std::cmp::max(1, cut));
        tracing::trace!("{}: {:02X?}...", name, &buf[..end]);
    }
}
