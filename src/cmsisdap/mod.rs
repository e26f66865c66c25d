//! CMSIS-DAP probe implementation.
pub mod commands;
#[cfg(test)]
pub(crate) mod mock;
pub mod tools;

use std::fmt::{self, Write};
use std::time::Duration;

use commands::general::connect::{ConnectRequest, ConnectResponse};
use commands::general::disconnect::{DisconnectRequest, DisconnectResponse};
use commands::general::host_status::HostStatusRequest;
use commands::general::info::{
    Capabilities, CapabilitiesCommand, PacketCountCommand, ProductFirmwareVersionCommand, ProductIdCommand,
    ProtocolVersionCommand, SWOTraceBufferSizeCommand, SerialNumberCommand, TargetBoardNameCommand, TargetBoardVendorCommand,
    TargetDeviceNameCommand, TargetDeviceVendorCommand, VendorCommand,
};
use commands::general::reset::{ResetRequest, ResetResponse};
use commands::jtag::configure::ConfigureRequest as JtagConfigureRequest;
use commands::jtag::sequence::{SequenceRequest as JtagSequenceRequest, SequenceResponse as JtagSequenceResponse};
use commands::swj::clock::SWJClockRequest;
use commands::swj::pins::{SWJPinsRequestBuilder, SWJPinsResponse};
use commands::swj::sequence::{SequenceRequest, SequenceResponse};
use commands::transfer::abort::TransferAbortRequest;
use commands::transfer::configure::ConfigureRequest;
use commands::transfer::write_abort::{WriteAbortRequest, WriteAbortResponse};
use commands::transfer::{TransferBlockRequest, TransferBlockResponse, TransferRequest, TransferResponse};
use commands::{swd, CmsisDapDevice, CmsisDapError, Request, RequestError, Status, Transport};

/// The protocol that is to be used by the probe when communicating with the target.
#[derive(Copy, Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Serial Wire Debug, ARM's two-wire debug protocol.
    Swd,
    /// IEEE 1149.1 JTAG.
    Jtag,
}

impl WireProtocol {
    /// The protocol to try when this one is unavailable.
    pub fn other(self) -> Self {
        match self {
            WireProtocol::Swd => WireProtocol::Jtag,
            WireProtocol::Jtag => WireProtocol::Swd,
        }
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

impl std::str::FromStr for WireProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "swd" => Ok(WireProtocol::Swd),
            "jtag" => Ok(WireProtocol::Jtag),
            _ => Err(format!("'{s}' is not a valid protocol. Choose from [swd, jtag].")),
        }
    }
}

/// What a probe can do, discovered once and never changed afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeCapabilities {
    pub packet_size: u16,
    pub packet_count: u8,
    /// CMSIS-DAP has no query for this, so it comes from configuration.
    pub max_clock_hz: u32,
    pub capabilities: Capabilities,
    pub protocol_version: Option<String>,
    /// Dormant wake-up and TARGETSEL, available from CMSIS-DAP 2.0 on.
    pub multidrop: bool,
    /// Only reported by probes with SWO support.
    pub swo_buffer_size: Option<u32>,
}

impl ProbeCapabilities {
    pub fn supports(&self, protocol: WireProtocol) -> bool {
        match protocol {
            WireProtocol::Swd => self.capabilities.swd_implemented,
            WireProtocol::Jtag => self.capabilities.jtag_implemented,
        }
    }

    pub fn protocols(&self) -> Vec<WireProtocol> {
        [WireProtocol::Swd, WireProtocol::Jtag]
            .into_iter()
            .filter(|p| self.supports(*p))
            .collect()
    }
}

/// Major version out of strings like `2.1.0` or `V1.10`.
fn protocol_major(version: &str) -> Option<u32> {
    let digits: String = version
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Identification strings reported by `DAP_Info`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub protocol_version: Option<String>,
    pub target_device_vendor: Option<String>,
    pub target_device_name: Option<String>,
    pub target_board_vendor: Option<String>,
    pub target_board_name: Option<String>,
    pub firmware_version: Option<String>,
}

impl fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fields = [
            ("Vendor", &self.vendor),
            ("Product", &self.product),
            ("Serial number", &self.serial_number),
            ("CMSIS-DAP version", &self.protocol_version),
            ("Firmware version", &self.firmware_version),
            ("Target vendor", &self.target_device_vendor),
            ("Target name", &self.target_device_name),
            ("Board vendor", &self.target_board_vendor),
            ("Board name", &self.target_board_name),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                writeln!(f, "{name}: {value}")?;
            }
        }
        Ok(())
    }
}

/// A CMSIS-DAP probe.
///
/// Thin typed layer over a [`Transport`]: one method per command, each
/// mapping a `DAP_ERROR` status to [`CmsisDapError::ErrorResponse`].
pub struct CmsisDap {
    device: Box<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for CmsisDap {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("CmsisDap")
            .field("packet_size", &self.device.packet_size())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CmsisDap {
    pub fn new(mut device: Box<dyn Transport>, timeout: Duration) -> Self {
        // Discard anything left in buffer, as otherwise
        // we'll get out of sync between requests and responses.
        device.drain();
        Self { device, timeout }
    }

    pub fn from_device(device: CmsisDapDevice, timeout: Duration) -> Self {
        Self::new(Box::new(device), timeout)
    }

    pub fn send<R: Request>(&mut self, request: &R) -> Result<R::Response, CmsisDapError> {
        commands::send_command(self.device.as_mut(), request, self.timeout)
    }

    pub fn packet_size(&self) -> usize {
        self.device.packet_size()
    }

    pub fn drain(&mut self) {
        self.device.drain();
    }

    /// Negotiate the packet size and read the capability set.
    #[tracing::instrument(skip(self))]
    pub fn query_capabilities(&mut self, max_clock_hz: u32) -> Result<ProbeCapabilities, CmsisDapError> {
        // Everything after this uses the negotiated size.
        let packet_size = commands::find_packet_size(self.device.as_mut(), self.timeout)? as u16;

        let packet_count = self.send(&PacketCountCommand {})?;
        let capabilities = self.send(&CapabilitiesCommand {})?;
        tracing::debug!("Detected probe capabilities: {:?}", capabilities);
        let mut swo_buffer_size = None;
        if capabilities.swo_uart_implemented || capabilities.swo_manchester_implemented {
            let size = self.send(&SWOTraceBufferSizeCommand {})?;
            tracing::debug!("Probe SWO buffer size: {}", size);
            swo_buffer_size = Some(size);
        }
        let protocol_version = self.send(&ProtocolVersionCommand {})?;
        let multidrop = protocol_version
            .as_deref()
            .and_then(protocol_major)
            .is_some_and(|major| major >= 2);

        Ok(ProbeCapabilities {
            packet_size,
            packet_count,
            max_clock_hz,
            capabilities,
            protocol_version,
            multidrop,
            swo_buffer_size,
        })
    }

    pub fn probe_info(&mut self) -> Result<ProbeInfo, CmsisDapError> {
        Ok(ProbeInfo {
            vendor: self.send(&VendorCommand {})?,
            product: self.send(&ProductIdCommand {})?,
            serial_number: self.send(&SerialNumberCommand {})?,
            protocol_version: self.send(&ProtocolVersionCommand {})?,
            target_device_vendor: self.send(&TargetDeviceVendorCommand {})?,
            target_device_name: self.send(&TargetDeviceNameCommand {})?,
            target_board_vendor: self.send(&TargetBoardVendorCommand {})?,
            target_board_name: self.send(&TargetBoardNameCommand {})?,
            firmware_version: self.send(&ProductFirmwareVersionCommand {})?,
        })
    }

    /// Select the port mode; `None` lets the probe use its default.
    pub fn connect_port(&mut self, protocol: Option<WireProtocol>) -> Result<WireProtocol, CmsisDapError> {
        let request = match protocol {
            Some(WireProtocol::Swd) => ConnectRequest::Swd,
            Some(WireProtocol::Jtag) => ConnectRequest::Jtag,
            None => ConnectRequest::DefaultPort,
        };

        match self.send(&request)? {
            ConnectResponse::SuccessfulInitForSWD => Ok(WireProtocol::Swd),
            ConnectResponse::SuccessfulInitForJTAG => Ok(WireProtocol::Jtag),
            ConnectResponse::InitFailed => Err(CmsisDapError::ErrorResponse(RequestError::InitFailed { protocol })),
        }
    }

    pub fn disconnect(&mut self) -> Result<(), CmsisDapError> {
        match self.send(&DisconnectRequest {})? {
            DisconnectResponse(Status::DapOk) => Ok(()),
            DisconnectResponse(Status::DapError) => Err(CmsisDapError::ErrorResponse(RequestError::Disconnect)),
        }
    }

    /// Tell the probe whether we are connected so it can drive its LED.
    pub fn host_status(&mut self, connected: bool) -> Result<(), CmsisDapError> {
        self.send(&HostStatusRequest::connected(connected)).map(|_| ())
    }

    /// Set maximum JTAG/SWD clock frequency to use, in Hz.
    ///
    /// The actual clock frequency used by the device might be lower.
    pub fn set_swj_clock(&mut self, clock_speed_hz: u32) -> Result<(), CmsisDapError> {
        let request = SWJClockRequest { clock_speed_hz };
        self.send(&request).and_then(|v| match v.status {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse(RequestError::SwjClock { request })),
        })
    }

    pub fn transfer_configure(&mut self, request: ConfigureRequest) -> Result<(), CmsisDapError> {
        self.send(&request).and_then(|v| match v.0 {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse(RequestError::TransferConfigure { request })),
        })
    }

    pub fn configure_swd(&mut self, request: swd::configure::ConfigureRequest) -> Result<(), CmsisDapError> {
        self.send(&request).and_then(|v| match v.0 {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse(RequestError::SwdConfigure { request })),
        })
    }

    pub fn send_jtag_configure(&mut self, request: JtagConfigureRequest) -> Result<(), CmsisDapError> {
        match self.send(&request)?.0 {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse(RequestError::JtagConfigure { request })),
        }
    }

    /// Returns the captured TDO bytes.
    pub fn send_jtag_sequences(&mut self, request: JtagSequenceRequest) -> Result<Vec<u8>, CmsisDapError> {
        match self.send(&request)? {
            JtagSequenceResponse(Status::DapOk, tdo) => Ok(tdo),
            JtagSequenceResponse(Status::DapError, _) => {
                Err(CmsisDapError::ErrorResponse(RequestError::JtagSequence { request }))
            }
        }
    }

    pub fn send_swj_sequences(&mut self, request: SequenceRequest) -> Result<(), CmsisDapError> {
        self.send(&request).and_then(|v| match v {
            SequenceResponse(Status::DapOk) => Ok(()),
            SequenceResponse(Status::DapError) => {
                Err(CmsisDapError::ErrorResponse(RequestError::SwjSequence { request }))
            }
        })
    }

    /// Clock out the low `bit_len` bits of `bits` on SWDIO/TMS, LSB first.
    pub fn swj_sequence(&mut self, bit_len: u8, bits: u64) -> Result<(), CmsisDapError> {
        if bit_len == 0 || bit_len > 64 {
            return Err(CmsisDapError::TooMuchData);
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            let mut seq = String::new();
            let _ = write!(&mut seq, "swj sequence:");
            for i in 0..bit_len {
                let _ = write!(&mut seq, "{}", (bits >> i) & 1);
            }
            tracing::trace!("{}", seq);
        }

        let data = bits.to_le_bytes();
        self.send_swj_sequences(SequenceRequest::new(&data, bit_len)?)
    }

    pub fn write_abort(&mut self, dap_index: u8, abort: u32) -> Result<(), CmsisDapError> {
        let request = WriteAbortRequest { dap_index, abort };
        match self.send(&request)? {
            WriteAbortResponse(Status::DapOk) => Ok(()),
            WriteAbortResponse(Status::DapError) => {
                Err(CmsisDapError::ErrorResponse(RequestError::WriteAbort { request }))
            }
        }
    }

    pub fn transfer(&mut self, request: &TransferRequest) -> Result<TransferResponse, CmsisDapError> {
        tracing::debug!("Sending DAP_Transfer with {} transfers", request.len());
        self.send(request)
    }

    pub fn transfer_block(&mut self, request: &TransferBlockRequest) -> Result<TransferBlockResponse, CmsisDapError> {
        self.send(request)
    }

    /// Stop a transfer the probe is still retrying. There is no response.
    pub fn transfer_abort(&mut self) -> Result<(), CmsisDapError> {
        self.send(&TransferAbortRequest)
    }

    /// Run the probe's device specific reset sequence.
    pub fn target_reset(&mut self) -> Result<(), CmsisDapError> {
        let response: ResetResponse = self.send(&ResetRequest)?;
        tracing::info!("Target reset response: {:?}", response);
        match response.status {
            Status::DapOk => Ok(()),
            Status::DapError => Err(CmsisDapError::ErrorResponse(RequestError::ResetTarget)),
        }
    }

    /// Drive nRESET; `false` asserts it.
    pub fn set_reset_pin(&mut self, level: bool) -> Result<SWJPinsResponse, CmsisDapError> {
        let request = SWJPinsRequestBuilder::new().nreset(level).build();
        let pins = self.send(&request)?;
        tracing::debug!("Pin response: {:?}", pins);
        Ok(pins)
    }
}
