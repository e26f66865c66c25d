//! A debug session over one probe.
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::ap::{self, Csw, DataSize, MemoryAp, Span};
use crate::cmsisdap::commands::jtag::configure::ConfigureRequest as JtagConfigureRequest;
use crate::cmsisdap::commands::swd::configure::ConfigureRequest as SwdConfigureRequest;
use crate::cmsisdap::commands::transfer::configure::ConfigureRequest;
use crate::cmsisdap::commands::{CmsisDapError, CommandId, RequestError};
use crate::cmsisdap::{CmsisDap, ProbeCapabilities, ProbeInfo, WireProtocol};
use crate::config::Config;
use crate::dp::regs::{Ctrl, Select, CTRL_ADDR, DPIDR, DPIDR_ADDR};
use crate::dp::DpAddress;
use crate::sequence::{SequenceEngine, SequenceError};
use crate::transfer::{
    unexpected_answer, BatchCommand, BlockResume, RegisterAddress, TransferEngine, TransferError, TransferResponse,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected(WireProtocol),
}

/// What the host knows about the probe and the target's debug port.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub status: SessionStatus,
    pub clock_hz: Option<u32>,
    /// SELECT value the target holds, `None` when unknown.
    pub select_cache: Option<Select>,
    pub sticky_error: bool,
    /// A request went unacknowledged and the line must be reset.
    pub line_reset_pending: bool,
    pub dpidr: Option<u32>,
    /// DAP index in the JTAG chain, 0 for SWD.
    pub dap_index: u8,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, SessionStatus::Connected(_))
    }

    /// Whether register transfers may go out, which includes the tail of a connect.
    pub fn link_active(&self) -> bool {
        self.status != SessionStatus::Disconnected
    }

    pub fn protocol(&self) -> Option<WireProtocol> {
        match self.status {
            SessionStatus::Connected(protocol) => Some(protocol),
            _ => None,
        }
    }

    fn reset(&mut self) {
        *self = SessionState::default();
    }
}

/// The public operation a [`DebugAccessError`] came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    ReadDp(u8),
    WriteDp(u8, u32),
    ReadAp(u32),
    WriteAp(u32, u32),
    ReadMemory { address: u32, len: usize },
    WriteMemory { address: u32, len: usize },
    Queue(BatchCommand),
    Flush,
    ClearSticky,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Access::ReadDp(address) => write!(f, "reading DP register {address:#04x}"),
            Access::WriteDp(address, value) => write!(f, "writing {value:#010x} to DP register {address:#04x}"),
            Access::ReadAp(address) => write!(f, "reading AP register {address:#010x}"),
            Access::WriteAp(address, value) => write!(f, "writing {value:#010x} to AP register {address:#010x}"),
            Access::ReadMemory { address, len } => write!(f, "reading {len} bytes at {address:#010x}"),
            Access::WriteMemory { address, len } => write!(f, "writing {len} bytes at {address:#010x}"),
            Access::Queue(command) => write!(f, "queueing {command}"),
            Access::Flush => f.write_str("flushing the transfer batch"),
            Access::ClearSticky => f.write_str("clearing sticky errors"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{access} failed")]
pub struct DebugAccessError {
    pub access: Access,
    #[source]
    pub cause: TransferError,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("the probe supports neither {requested} nor a usable fallback")]
    UnsupportedProtocol { requested: WireProtocol },
    #[error("the probe failed to initialize the port after {attempts} attempts")]
    ConnectFailed { attempts: usize },
    #[error("multi-drop SWD is not supported by this probe or protocol")]
    MultidropUnsupported,
    #[error("the debug and system power domains did not come up in time")]
    PowerUpTimeout,
    #[error(transparent)]
    Access(#[from] DebugAccessError),
    #[error("error communicating with the probe")]
    Probe(#[from] CmsisDapError),
}

impl From<SequenceError> for SessionError {
    fn from(error: SequenceError) -> Self {
        match error {
            SequenceError::MultidropNeedsSwd => SessionError::MultidropUnsupported,
            SequenceError::Probe(e) => SessionError::Probe(e),
        }
    }
}

/// Owns the probe and serializes every debug operation on it.
#[derive(Debug)]
pub struct Session {
    probe: CmsisDap,
    config: Config,
    capabilities: Option<ProbeCapabilities>,
    state: SessionState,
    engine: TransferEngine,
}

impl Session {
    pub fn new(probe: CmsisDap, config: Config) -> Self {
        Self {
            probe,
            config,
            capabilities: None,
            state: SessionState::default(),
            engine: TransferEngine::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// DPIDR read during connect.
    pub fn idcode(&self) -> Option<u32> {
        self.state.dpidr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Capabilities, queried from the probe the first time.
    pub fn capabilities(&mut self) -> Result<&ProbeCapabilities, SessionError> {
        let caps = match self.capabilities.take() {
            Some(caps) => caps,
            None => {
                let result = self.probe.query_capabilities(self.config.probe.max_clock_hz);
                let caps = self.probe_result(result)?;
                tracing::debug!("Probe capabilities: {:?}", caps);
                caps
            }
        };
        Ok(self.capabilities.insert(caps))
    }

    pub fn probe_info(&mut self) -> Result<ProbeInfo, SessionError> {
        let result = self.probe.probe_info();
        self.probe_result(result)
    }

    /// Give up the probe, e.g. for a firmware update.
    pub fn into_probe(mut self) -> CmsisDap {
        if let Err(e) = self.disconnect() {
            tracing::warn!("Disconnect before releasing the probe failed: {}", e);
        }
        self.probe
    }

    /// Connect to the target, preferring `hint` over the configured protocol.
    ///
    /// A session that is already connected is disconnected first.
    #[tracing::instrument(skip(self))]
    pub fn connect(&mut self, hint: Option<WireProtocol>) -> Result<WireProtocol, SessionError> {
        if self.state.is_connected() {
            tracing::debug!("Already connected, reconnecting");
            self.disconnect()?;
        }

        let caps = self.capabilities()?.clone();
        let requested = hint.unwrap_or(self.config.session.protocol);
        let protocol = choose_protocol(&caps, requested, self.config.session.allow_protocol_fallback)?;

        if self.config.session.target_sel.is_some() && (!caps.multidrop || protocol != WireProtocol::Swd) {
            return Err(SessionError::MultidropUnsupported);
        }

        self.state.reset();
        self.state.status = SessionStatus::Connecting;
        match self.connect_inner(&caps, protocol) {
            Ok(()) => {
                self.state.status = SessionStatus::Connected(protocol);
                tracing::info!("Connected over {}", protocol);
                Ok(protocol)
            }
            Err(e) => {
                tracing::warn!("Connect failed: {}", e);
                self.engine.discard();
                self.state.reset();
                self.probe.drain();
                Err(e)
            }
        }
    }

    fn connect_inner(&mut self, caps: &ProbeCapabilities, protocol: WireProtocol) -> Result<(), SessionError> {
        self.connect_port(protocol)?;

        let clock_hz = self.config.session.clock_hz.min(caps.max_clock_hz);
        self.probe.set_swj_clock(clock_hz)?;
        self.state.clock_hz = Some(clock_hz);

        self.probe.transfer_configure(ConfigureRequest {
            idle_cycles: self.config.transfer.idle_cycles,
            wait_retry: self.config.transfer.probe_wait_retry,
            match_retry: self.config.transfer.match_retry,
        })?;

        match protocol {
            WireProtocol::Swd => self.probe.configure_swd(SwdConfigureRequest::default())?,
            WireProtocol::Jtag => {
                let request = JtagConfigureRequest::new(self.config.session.jtag_ir_lengths.clone())?;
                self.probe.send_jtag_configure(request)?;
                self.state.dap_index = self.config.session.jtag_index;
            }
        }

        SequenceEngine::new(&mut self.probe, protocol).connect(DpAddress::from(self.config.session.target_sel))?;

        let dpidr = self
            .run_now(BatchCommand::Read(RegisterAddress::Dp(DPIDR_ADDR)))
            .and_then(read_value)
            .map_err(access_error(Access::ReadDp(DPIDR_ADDR)))?;
        let id = DPIDR(dpidr);
        tracing::debug!(
            "DPIDR {:#010x}: DPv{} part {:#x} revision {}",
            dpidr,
            id.version(),
            id.part_no(),
            id.revision()
        );
        self.state.dpidr = Some(dpidr);

        if self.config.session.power_up {
            self.power_up()?;
        }

        self.probe.host_status(true)?;
        Ok(())
    }

    fn connect_port(&mut self, protocol: WireProtocol) -> Result<(), SessionError> {
        let attempts = self.config.session.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.probe.connect_port(Some(protocol)) {
                Ok(connected) if connected == protocol => return Ok(()),
                Ok(connected) => tracing::warn!("Probe selected {} instead of {}", connected, protocol),
                Err(CmsisDapError::ErrorResponse(RequestError::InitFailed { .. })) => {
                    tracing::warn!("Port initialization failed, attempt {} of {}", attempt, attempts)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SessionError::ConnectFailed { attempts })
    }

    /// Clear sticky flags, then request debug and system power and wait
    /// for both acknowledges.
    fn power_up(&mut self) -> Result<(), SessionError> {
        self.engine
            .clear_sticky_errors(&mut self.probe, &mut self.state)
            .map_err(access_error(Access::ClearSticky))?;

        let mut ctrl = Ctrl(0);
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_mask_lane(0xF);
        self.run_now(BatchCommand::Write(RegisterAddress::Dp(CTRL_ADDR), ctrl.0))
            .map_err(access_error(Access::WriteDp(CTRL_ADDR, ctrl.0)))?;

        let deadline = Instant::now() + Duration::from_millis(self.config.session.power_up_timeout_ms);
        loop {
            let ctrl = self
                .run_now(BatchCommand::Read(RegisterAddress::Dp(CTRL_ADDR)))
                .and_then(read_value)
                .map(Ctrl)
                .map_err(access_error(Access::ReadDp(CTRL_ADDR)))?;
            if ctrl.cdbgpwrupack() && ctrl.csyspwrupack() {
                tracing::debug!("Debug and system domains powered up");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SessionError::PowerUpTimeout);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Leave the target alone. Does nothing when already disconnected.
    #[tracing::instrument(skip(self))]
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.state.status == SessionStatus::Disconnected {
            return Ok(());
        }

        self.engine.discard();
        let status = self.probe.host_status(false);
        let result = status.and(self.probe.disconnect());
        self.state.reset();
        tracing::info!("Disconnected");
        Ok(result?)
    }

    pub fn set_clock(&mut self, clock_hz: u32) -> Result<u32, SessionError> {
        let max = self.capabilities()?.max_clock_hz;
        let clock_hz = clock_hz.min(max);
        let result = self.probe.set_swj_clock(clock_hz);
        self.probe_result(result)?;
        self.state.clock_hz = Some(clock_hz);
        Ok(clock_hz)
    }

    pub fn target_reset(&mut self) -> Result<(), SessionError> {
        let result = self.probe.target_reset();
        self.probe_result(result)
    }

    /// Drive nRESET; `false` holds the target in reset.
    pub fn set_reset_pin(&mut self, level: bool) -> Result<(), SessionError> {
        let result = self.probe.set_reset_pin(level).map(|_| ());
        self.probe_result(result)
    }

    pub fn read_dp(&mut self, address: u8) -> Result<u32, DebugAccessError> {
        let result = self.prepare().and_then(|()| {
            let address = RegisterAddress::dp(address)?;
            self.run_now(BatchCommand::Read(address)).and_then(read_value)
        });
        self.checked(Access::ReadDp(address), result)
    }

    pub fn write_dp(&mut self, address: u8, value: u32) -> Result<(), DebugAccessError> {
        let result = self.prepare().and_then(|()| {
            let address = RegisterAddress::dp(address)?;
            self.run_now(BatchCommand::Write(address, value)).map(|_| ())
        });
        self.checked(Access::WriteDp(address, value), result)
    }

    /// `address` is `APSEL << 24 | register`, the register's upper nibble being its bank.
    pub fn read_ap(&mut self, address: u32) -> Result<u32, DebugAccessError> {
        let result = self.prepare().and_then(|()| {
            let address = RegisterAddress::ap(address)?;
            self.run_now(BatchCommand::Read(address)).and_then(read_value)
        });
        self.checked(Access::ReadAp(address), result)
    }

    pub fn write_ap(&mut self, address: u32, value: u32) -> Result<(), DebugAccessError> {
        let result = self.prepare().and_then(|()| {
            let address = RegisterAddress::ap(address)?;
            self.run_now(BatchCommand::Write(address, value)).map(|_| ())
        });
        self.checked(Access::WriteAp(address, value), result)
    }

    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, DebugAccessError> {
        let result = self.prepare().and_then(|()| self.read_memory_inner(address, len));
        self.checked(Access::ReadMemory { address, len }, result)
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DebugAccessError> {
        let result = self.prepare().and_then(|()| self.write_memory_inner(address, data));
        self.checked(
            Access::WriteMemory {
                address,
                len: data.len(),
            },
            result,
        )
    }

    /// Add `command` to the explicit batch, returning its index.
    pub fn queue(&mut self, command: BatchCommand) -> Result<usize, DebugAccessError> {
        let prepared = if self.engine.is_empty() { self.prepare() } else { Ok(()) };
        let result = prepared.and_then(|()| self.engine.queue(&self.state, self.probe.packet_size(), command));
        self.checked(Access::Queue(command), result)
    }

    pub fn flush(&mut self) -> Result<Vec<TransferResponse>, DebugAccessError> {
        let result = self
            .engine
            .flush(&mut self.probe, &mut self.state, &self.config.transfer);
        self.checked(Access::Flush, result)
    }

    pub fn clear_sticky_errors(&mut self) -> Result<(), DebugAccessError> {
        let result = self.engine.clear_sticky_errors(&mut self.probe, &mut self.state);
        self.checked(Access::ClearSticky, result)
    }

    /// Stop a transfer the probe keeps retrying and drop the queued batch.
    pub fn abort_transfer(&mut self) -> Result<(), DebugAccessError> {
        let result = self.engine.abort_transfer(&mut self.probe);
        self.state.select_cache = None;
        self.checked(Access::Flush, result)
    }

    fn memory_ap(&self) -> MemoryAp {
        MemoryAp::new(self.config.session.mem_ap)
    }

    fn read_memory_inner(&mut self, address: u32, len: usize) -> Result<Vec<u8>, TransferError> {
        let ap = self.memory_ap();
        let mut data = Vec::with_capacity(len);

        for span in ap::plan(address, len) {
            match span {
                Span::Byte { address } => {
                    let values = self.run_commands(&[
                        BatchCommand::Write(ap.csw(), Csw::for_size(DataSize::U8).0),
                        BatchCommand::Write(ap.tar(), address),
                        BatchCommand::Read(ap.drw()),
                    ])?;
                    let word = read_value(values.last().copied().flatten())?;
                    data.push((word >> ap::lane_shift(address)) as u8);
                }
                Span::Words { address, words } => {
                    self.run_commands(&[
                        BatchCommand::Write(ap.csw(), Csw::for_size(DataSize::U32).0),
                        BatchCommand::Write(ap.tar(), address),
                    ])?;
                    let resume = BlockResume {
                        register: ap.tar(),
                        base: address,
                    };
                    let read = self.engine.read_block(
                        &mut self.probe,
                        &mut self.state,
                        &self.config.transfer,
                        ap.drw(),
                        words,
                        Some(resume),
                    )?;
                    data.extend(read.iter().flat_map(|word| word.to_le_bytes()));
                }
            }
        }

        Ok(data)
    }

    fn write_memory_inner(&mut self, address: u32, data: &[u8]) -> Result<(), TransferError> {
        let ap = self.memory_ap();
        let mut offset = 0;

        for span in ap::plan(address, data.len()) {
            match span {
                Span::Byte { address } => {
                    let value = (data[offset] as u32) << ap::lane_shift(address);
                    self.run_commands(&[
                        BatchCommand::Write(ap.csw(), Csw::for_size(DataSize::U8).0),
                        BatchCommand::Write(ap.tar(), address),
                        BatchCommand::Write(ap.drw(), value),
                    ])?;
                    offset += 1;
                }
                Span::Words { address, words } => {
                    let bytes = &data[offset..offset + 4 * words];
                    let values: Vec<u32> = bytes
                        .chunks_exact(4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                    self.run_commands(&[
                        BatchCommand::Write(ap.csw(), Csw::for_size(DataSize::U32).0),
                        BatchCommand::Write(ap.tar(), address),
                    ])?;
                    let resume = BlockResume {
                        register: ap.tar(),
                        base: address,
                    };
                    self.engine.write_block(
                        &mut self.probe,
                        &mut self.state,
                        &self.config.transfer,
                        ap.drw(),
                        &values,
                        Some(resume),
                    )?;
                    offset += 4 * words;
                }
            }
        }

        Ok(())
    }

    fn run_now(&mut self, command: BatchCommand) -> Result<Option<u32>, TransferError> {
        self.engine
            .run_now(&mut self.probe, &mut self.state, &self.config.transfer, command)
    }

    /// Send `commands` as one batch, failing on the first failed response.
    fn run_commands(&mut self, commands: &[BatchCommand]) -> Result<Vec<Option<u32>>, TransferError> {
        if !self.engine.is_empty() {
            return Err(TransferError::BatchPending);
        }
        let packet_size = self.probe.packet_size();
        for command in commands {
            if let Err(e) = self.engine.queue(&self.state, packet_size, *command) {
                self.engine.discard();
                return Err(e);
            }
        }
        self.engine
            .flush(&mut self.probe, &mut self.state, &self.config.transfer)?
            .into_iter()
            .map(TransferResponse::into_result)
            .collect()
    }

    /// Deferred recovery before an access: automatic sticky clearing and
    /// the line reset a missing acknowledge asked for.
    fn prepare(&mut self) -> Result<(), TransferError> {
        if !self.state.is_connected() {
            return Err(TransferError::NotConnected);
        }
        if self.state.sticky_error && self.config.session.auto_clear_sticky {
            self.engine.clear_sticky_errors(&mut self.probe, &mut self.state)?;
        }
        if self.state.line_reset_pending {
            self.recover_line()?;
        }
        Ok(())
    }

    fn recover_line(&mut self) -> Result<(), TransferError> {
        tracing::debug!("Recovering the line after a missing acknowledge");
        let protocol = self.state.protocol().unwrap_or(self.config.session.protocol);
        let mut sequences = SequenceEngine::new(&mut self.probe, protocol);
        match protocol {
            WireProtocol::Jtag => sequences.jtag_tap_reset()?,
            WireProtocol::Swd => {
                sequences.line_reset(2)?;
                if let Some(target_sel) = self.config.session.target_sel {
                    sequences.target_select(target_sel)?;
                    sequences.idle(2)?;
                }
            }
        }

        self.state.select_cache = None;
        self.state.line_reset_pending = false;
        let dpidr = self
            .run_now(BatchCommand::Read(RegisterAddress::Dp(DPIDR_ADDR)))
            .and_then(read_value)?;
        if self.state.dpidr != Some(dpidr) {
            tracing::warn!("DPIDR changed to {:#010x} after line reset", dpidr);
            self.state.dpidr = Some(dpidr);
        }
        Ok(())
    }

    fn checked<T>(&mut self, access: Access, result: Result<T, TransferError>) -> Result<T, DebugAccessError> {
        result.map_err(|cause| {
            if cause.is_session_fatal() {
                self.force_disconnect();
            }
            DebugAccessError { access, cause }
        })
    }

    fn probe_result<T>(&mut self, result: Result<T, CmsisDapError>) -> Result<T, SessionError> {
        result.map_err(|e| {
            if e.send_error().is_some() {
                self.force_disconnect();
            }
            SessionError::Probe(e)
        })
    }

    fn force_disconnect(&mut self) {
        if self.state.status != SessionStatus::Disconnected {
            tracing::warn!("Lost the link to the probe, session disconnected");
        }
        self.engine.discard();
        self.state.reset();
        self.probe.drain();
    }
}

fn choose_protocol(
    caps: &ProbeCapabilities,
    requested: WireProtocol,
    allow_fallback: bool,
) -> Result<WireProtocol, SessionError> {
    if caps.supports(requested) {
        return Ok(requested);
    }
    let other = requested.other();
    if allow_fallback && caps.supports(other) {
        tracing::warn!("Probe does not support {}, falling back to {}", requested, other);
        return Ok(other);
    }
    Err(SessionError::UnsupportedProtocol { requested })
}

fn access_error(access: Access) -> impl FnOnce(TransferError) -> DebugAccessError {
    move |cause| DebugAccessError { access, cause }
}

fn read_value(value: Option<u32>) -> Result<u32, TransferError> {
    value.ok_or_else(|| unexpected_answer(CommandId::Transfer))
}
