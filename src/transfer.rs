//! Batched DP/AP register transfers.
//!
//! Requests are queued into a batch that becomes one or more `DAP_Transfer`
//! frames on [`TransferEngine::flush`]. Bank switches are resolved while the
//! batch is built: whenever a request needs a different SELECT value than the
//! one the target will hold at that point, a SELECT write is queued in front
//! of it. Those writes never show up in the responses.
use std::fmt;
use std::mem;

use crate::cmsisdap::commands::transfer::{Ack, Port, TransferBlockRequest, TransferRequest, TransferStatusByte};
use crate::cmsisdap::commands::{CmsisDapError, CommandId, FramingError, SendError};
use crate::cmsisdap::CmsisDap;
use crate::config::TransferConfig;
use crate::dp::regs::{Abort, Select, CTRL_ADDR, SELECT_ADDR};
use crate::session::SessionState;

/// The transfer count of `DAP_Transfer` is a single byte.
const MAX_TRANSFERS: usize = 255;

/// A DP or AP register. The upper nibble of the register address is the bank.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterAddress {
    Dp(u8),
    Ap { ap: u8, address: u8 },
}

impl RegisterAddress {
    pub fn dp(address: u8) -> Result<Self, TransferError> {
        if address & 0x3 != 0 {
            return Err(TransferError::InvalidAddress(address as u32));
        }
        Ok(RegisterAddress::Dp(address))
    }

    /// From the `APSEL << 24 | register` form.
    pub fn ap(address: u32) -> Result<Self, TransferError> {
        if address & 0x00FF_FF03 != 0 {
            return Err(TransferError::InvalidAddress(address));
        }
        Ok(RegisterAddress::Ap {
            ap: (address >> 24) as u8,
            address: address as u8,
        })
    }

    pub fn port(&self) -> Port {
        match self {
            RegisterAddress::Dp(_) => Port::DebugPort,
            RegisterAddress::Ap { .. } => Port::AccessPort,
        }
    }

    fn register(&self) -> u8 {
        match *self {
            RegisterAddress::Dp(address) => address,
            RegisterAddress::Ap { address, .. } => address,
        }
    }

    /// Address bits A[3:2] as sent on the wire.
    pub fn a2a3(&self) -> u8 {
        self.register() & 0x0C
    }

    pub fn bank(&self) -> u8 {
        self.register() >> 4
    }

    /// The SELECT value this access needs, or `None` if `current` already fits.
    ///
    /// Only DP address 0x4 is banked; fields the access does not care about
    /// are kept from `current`.
    fn required_select(&self, current: Option<Select>) -> Option<Select> {
        let mut select = current.unwrap_or(Select(0));
        match *self {
            RegisterAddress::Dp(address) if address & 0x0C == CTRL_ADDR => select.set_dp_bank_sel(self.bank()),
            RegisterAddress::Dp(_) => return None,
            RegisterAddress::Ap { ap, .. } => {
                select.set_ap_sel(ap);
                select.set_ap_bank_sel(self.bank());
            }
        }

        if current == Some(select) {
            None
        } else {
            Some(select)
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegisterAddress::Dp(address) => write!(f, "DP register {address:#04x}"),
            RegisterAddress::Ap { ap, address } => write!(f, "AP {ap} register {address:#04x}"),
        }
    }
}

/// A register access queued in a batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchCommand {
    Read(RegisterAddress),
    Write(RegisterAddress, u32),
}

impl BatchCommand {
    pub fn address(&self) -> RegisterAddress {
        match *self {
            BatchCommand::Read(address) | BatchCommand::Write(address, _) => address,
        }
    }
}

impl fmt::Display for BatchCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BatchCommand::Read(address) => write!(f, "Read({address})"),
            BatchCommand::Write(address, data) => write!(f, "Write({address}, data={data:#010x})"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    /// FAULT, or an SWD parity/protocol error.
    Fault,
    NoResponse,
    /// WAIT until the retry limit ran out.
    RetryExhausted,
    /// Not attempted because an earlier request in the batch failed.
    Aborted,
}

/// The outcome of one queued request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferResponse {
    /// Position of the request in its batch.
    pub index: usize,
    pub status: TransferStatus,
    /// Set for successful reads.
    pub value: Option<u32>,
}

impl TransferResponse {
    pub fn into_result(self) -> Result<Option<u32>, TransferError> {
        match self.status {
            TransferStatus::Ok => Ok(self.value),
            failure => Err(failure_error(failure)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("the session is not connected")]
    NotConnected,
    #[error("a sticky error is pending and must be cleared first")]
    StickyErrorPending,
    #[error("the batch cannot take another transfer")]
    BatchFull,
    #[error("a queued batch must be flushed first")]
    BatchPending,
    #[error("the target kept answering WAIT")]
    RetryExhausted,
    #[error("the target answered FAULT")]
    Fault,
    #[error("the target did not acknowledge")]
    NoResponse,
    #[error("the transfer was dropped after an earlier failure")]
    Aborted,
    #[error("{0:#x} is not a valid register address")]
    InvalidAddress(u32),
    #[error(transparent)]
    Probe(#[from] CmsisDapError),
}

impl TransferError {
    /// Whether the link to the probe can no longer be trusted.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, TransferError::Probe(CmsisDapError::Send { .. }))
    }
}

fn failure_error(status: TransferStatus) -> TransferError {
    match status {
        TransferStatus::Fault => TransferError::Fault,
        TransferStatus::NoResponse => TransferError::NoResponse,
        TransferStatus::RetryExhausted => TransferError::RetryExhausted,
        TransferStatus::Ok | TransferStatus::Aborted => TransferError::Aborted,
    }
}

pub(crate) fn unexpected_answer(command_id: CommandId) -> TransferError {
    TransferError::Probe(CmsisDapError::Send {
        command_id,
        source: SendError::Framing(FramingError::UnexpectedAnswer),
    })
}

/// A transfer as it goes on the wire.
#[derive(Copy, Clone, Debug)]
struct WireTransfer {
    port: Port,
    address: u8,
    value: Option<u32>,
    /// SELECT value the target holds once this transfer completed.
    select: Option<Select>,
    /// Index of the caller's request, `None` for injected SELECT writes.
    origin: Option<usize>,
}

impl WireTransfer {
    fn select(select: Select) -> Self {
        Self {
            port: Port::DebugPort,
            address: SELECT_ADDR,
            value: Some(select.0),
            select: Some(select),
            origin: None,
        }
    }

    fn request(command: BatchCommand, index: usize) -> Self {
        let address = command.address();
        let value = match command {
            BatchCommand::Read(_) => None,
            BatchCommand::Write(_, value) => Some(value),
        };
        let select = match (address, value) {
            (RegisterAddress::Dp(SELECT_ADDR), Some(value)) => Some(Select(value)),
            _ => None,
        };
        Self {
            port: address.port(),
            address: address.a2a3(),
            value,
            select,
            origin: Some(index),
        }
    }
}

fn transfer_request<'a>(dap_index: u8, transfers: impl IntoIterator<Item = &'a WireTransfer>) -> TransferRequest {
    let mut request = TransferRequest::new(dap_index);
    for transfer in transfers {
        match transfer.value {
            Some(value) => request.add_write(transfer.port, transfer.address, value),
            None => request.add_read(transfer.port, transfer.address),
        }
    }
    request
}

/// Where a block transfer failed, and how.
enum Outcome {
    Done,
    Failed { at: usize, status: TransferStatus },
}

/// The register rewritten before a block transfer resumes after WAIT,
/// typically a MEM-AP TAR. It is set to `base + 4 * words_done`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockResume {
    pub register: RegisterAddress,
    pub base: u32,
}

#[derive(Debug, Default)]
pub struct TransferEngine {
    batch: Vec<WireTransfer>,
    /// SELECT value after the last queued transfer.
    projected_select: Option<Select>,
    requests: usize,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of caller requests queued.
    pub fn len(&self) -> usize {
        self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests == 0
    }

    /// Drop the queued batch without sending it.
    pub fn discard(&mut self) {
        self.batch.clear();
        self.requests = 0;
        self.projected_select = None;
    }

    fn check_ready(state: &SessionState) -> Result<(), TransferError> {
        if !state.link_active() {
            return Err(TransferError::NotConnected);
        }
        if state.sticky_error {
            return Err(TransferError::StickyErrorPending);
        }
        Ok(())
    }

    /// Queue `command`, returning its index in the batch.
    pub fn queue(
        &mut self,
        state: &SessionState,
        packet_size: usize,
        command: BatchCommand,
    ) -> Result<usize, TransferError> {
        Self::check_ready(state)?;

        let current = if self.batch.is_empty() {
            state.select_cache
        } else {
            self.projected_select
        };

        let mut entries = Vec::with_capacity(2);
        let mut projected = current;
        if let Some(select) = command.address().required_select(current) {
            entries.push(WireTransfer::select(select));
            projected = Some(select);
        }
        let entry = WireTransfer::request(command, self.requests);
        if let Some(select) = entry.select {
            projected = Some(select);
        }
        entries.push(entry);

        if !self.fits(&entries, packet_size) {
            return Err(TransferError::BatchFull);
        }

        tracing::trace!("Queued {} as request {}", command, self.requests);
        self.batch.extend(entries);
        self.projected_select = projected;
        self.requests += 1;
        Ok(self.requests - 1)
    }

    fn fits(&self, extra: &[WireTransfer], packet_size: usize) -> bool {
        let request = transfer_request(0, self.batch.iter().chain(extra));
        request.len() <= MAX_TRANSFERS
            && request.request_size() <= packet_size
            && request.response_size() <= packet_size
    }

    /// Send the batch, returning exactly one response per queued request.
    #[tracing::instrument(skip_all, fields(requests = self.requests))]
    pub fn flush(
        &mut self,
        probe: &mut CmsisDap,
        state: &mut SessionState,
        config: &TransferConfig,
    ) -> Result<Vec<TransferResponse>, TransferError> {
        let batch = mem::take(&mut self.batch);
        let requests = mem::replace(&mut self.requests, 0);
        self.projected_select = None;

        Self::check_ready(state)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!("Flushing {} transfers for {} requests", batch.len(), requests);

        let mut responses = Vec::with_capacity(requests);
        let outcome = match run_batch(probe, state, config, &batch, &mut responses) {
            Ok(outcome) => outcome,
            Err(e) => {
                state.select_cache = None;
                return Err(e);
            }
        };

        if let Outcome::Failed { at, status } = outcome {
            state.select_cache = None;
            let mut status = Some(status);
            for entry in &batch[at..] {
                if let Some(index) = entry.origin {
                    responses.push(TransferResponse {
                        index,
                        status: status.take().unwrap_or(TransferStatus::Aborted),
                        value: None,
                    });
                }
            }
        }

        Ok(responses)
    }

    /// Queue and flush a single request.
    pub fn run_now(
        &mut self,
        probe: &mut CmsisDap,
        state: &mut SessionState,
        config: &TransferConfig,
        command: BatchCommand,
    ) -> Result<Option<u32>, TransferError> {
        if !self.is_empty() {
            return Err(TransferError::BatchPending);
        }
        self.queue(state, probe.packet_size(), command)?;
        let responses = self.flush(probe, state, config)?;
        match responses.into_iter().next() {
            Some(response) => response.into_result(),
            None => Err(unexpected_answer(CommandId::Transfer)),
        }
    }

    /// `DAP_WriteABORT` clearing every sticky flag.
    pub fn clear_sticky_errors(&mut self, probe: &mut CmsisDap, state: &mut SessionState) -> Result<(), TransferError> {
        if !state.link_active() {
            return Err(TransferError::NotConnected);
        }
        probe.write_abort(state.dap_index, Abort::clear_sticky().0)?;
        tracing::debug!("Sticky errors cleared");
        state.sticky_error = false;
        Ok(())
    }

    /// Give up on a transfer the probe is still retrying.
    pub fn abort_transfer(&mut self, probe: &mut CmsisDap) -> Result<(), TransferError> {
        self.discard();
        Ok(probe.transfer_abort()?)
    }

    /// Read `count` words from one register with `DAP_TransferBlock`.
    pub fn read_block(
        &mut self,
        probe: &mut CmsisDap,
        state: &mut SessionState,
        config: &TransferConfig,
        address: RegisterAddress,
        count: usize,
        resume: Option<BlockResume>,
    ) -> Result<Vec<u32>, TransferError> {
        self.run_block(probe, state, config, address, BlockData::Read(count), resume)
    }

    /// Write `data` to one register with `DAP_TransferBlock`.
    pub fn write_block(
        &mut self,
        probe: &mut CmsisDap,
        state: &mut SessionState,
        config: &TransferConfig,
        address: RegisterAddress,
        data: &[u32],
        resume: Option<BlockResume>,
    ) -> Result<(), TransferError> {
        self.run_block(probe, state, config, address, BlockData::Write(data), resume)
            .map(|_| ())
    }

    fn ensure_selected(
        &mut self,
        probe: &mut CmsisDap,
        state: &mut SessionState,
        config: &TransferConfig,
        address: RegisterAddress,
    ) -> Result<(), TransferError> {
        if let Some(select) = address.required_select(state.select_cache) {
            self.run_now(
                probe,
                state,
                config,
                BatchCommand::Write(RegisterAddress::Dp(SELECT_ADDR), select.0),
            )?;
        }
        Ok(())
    }

    fn run_block(
        &mut self,
        probe: &mut CmsisDap,
        state: &mut SessionState,
        config: &TransferConfig,
        address: RegisterAddress,
        data: BlockData<'_>,
        resume: Option<BlockResume>,
    ) -> Result<Vec<u32>, TransferError> {
        Self::check_ready(state)?;
        if !self.is_empty() {
            return Err(TransferError::BatchPending);
        }
        self.ensure_selected(probe, state, config, address)?;

        let total = data.len();
        let max_words = TransferBlockRequest::max_words(probe.packet_size()).max(1);
        let limit = config.wait_retry_limit.max(1);
        let mut read = Vec::with_capacity(if data.is_read() { total } else { 0 });
        let mut done = 0;
        let mut waits = 0;

        while done < total {
            let n = (total - done).min(max_words);
            let request = match data {
                BlockData::Read(_) => {
                    TransferBlockRequest::read_request(state.dap_index, address.port(), address.a2a3(), n as u16)
                }
                BlockData::Write(words) => TransferBlockRequest::write_request(
                    state.dap_index,
                    address.port(),
                    address.a2a3(),
                    words[done..done + n].to_vec(),
                ),
            };

            let response = match probe.transfer_block(&request) {
                Ok(response) => response,
                Err(e) => {
                    state.select_cache = None;
                    return Err(e.into());
                }
            };
            let completed = response.transfer_count as usize;
            read.extend(response.data);
            done += completed;

            let status = response.status;
            if status.is_ok() {
                if completed != n {
                    state.select_cache = None;
                    return Err(unexpected_answer(CommandId::TransferBlock));
                }
                waits = 0;
                continue;
            }

            match classify(state, &status) {
                TransferStatus::Ok => {
                    // The WAIT is on the first word not yet transferred.
                    if completed > 0 {
                        waits = 0;
                    }
                    waits += 1;
                    if waits >= limit {
                        state.select_cache = None;
                        return Err(TransferError::RetryExhausted);
                    }
                    tracing::debug!("WAIT after {} of {} words, resuming", done, total);
                    if let Some(resume) = resume {
                        self.run_now(
                            probe,
                            state,
                            config,
                            BatchCommand::Write(resume.register, resume.base.wrapping_add(4 * done as u32)),
                        )?;
                        self.ensure_selected(probe, state, config, address)?;
                    }
                }
                failure => {
                    state.select_cache = None;
                    return Err(failure_error(failure));
                }
            }
        }

        Ok(read)
    }
}

#[derive(Copy, Clone)]
enum BlockData<'a> {
    Read(usize),
    Write(&'a [u32]),
}

impl BlockData<'_> {
    fn len(&self) -> usize {
        match self {
            BlockData::Read(count) => *count,
            BlockData::Write(words) => words.len(),
        }
    }

    fn is_read(&self) -> bool {
        matches!(self, BlockData::Read(_))
    }
}

/// Map a failed status byte to its outcome and apply its side effects on
/// `state`. `Ok` here means WAIT, which is the caller's to retry.
fn classify(state: &mut SessionState, status: &TransferStatusByte) -> TransferStatus {
    if status.protocol_error {
        tracing::warn!("SWD protocol error, handled as FAULT");
        state.sticky_error = true;
        return TransferStatus::Fault;
    }
    match status.ack {
        Ack::Wait => TransferStatus::Ok,
        Ack::Fault => {
            tracing::warn!("Target answered FAULT, sticky error set");
            state.sticky_error = true;
            TransferStatus::Fault
        }
        Ack::Ok => {
            tracing::warn!("Read value mismatch");
            TransferStatus::Fault
        }
        Ack::NoAck => {
            tracing::warn!("No acknowledge from target, line reset pending");
            state.line_reset_pending = true;
            TransferStatus::NoResponse
        }
    }
}

/// Send `batch`, pushing a response for every completed caller request.
fn run_batch(
    probe: &mut CmsisDap,
    state: &mut SessionState,
    config: &TransferConfig,
    batch: &[WireTransfer],
    responses: &mut Vec<TransferResponse>,
) -> Result<Outcome, TransferError> {
    let limit = config.wait_retry_limit.max(1);
    let mut cursor = 0;
    let mut waits = 0;

    while cursor < batch.len() {
        // After a WAIT only the waiting transfer goes out until it completes.
        let chunk = if waits > 0 {
            &batch[cursor..=cursor]
        } else {
            &batch[cursor..]
        };

        let request = transfer_request(state.dap_index, chunk);
        let response = probe.transfer(&request)?;
        for (transfer, data) in chunk.iter().zip(&response.data) {
            if let Some(select) = transfer.select {
                state.select_cache = Some(select);
            }
            if let Some(index) = transfer.origin {
                responses.push(TransferResponse {
                    index,
                    status: TransferStatus::Ok,
                    value: *data,
                });
            }
        }
        cursor += response.transfer_count;

        if response.status.is_ok() {
            if response.transfer_count != chunk.len() {
                return Err(unexpected_answer(CommandId::Transfer));
            }
            waits = 0;
            continue;
        }
        if response.transfer_count >= chunk.len() {
            // Everything completed yet the status reports a failure.
            return Err(unexpected_answer(CommandId::Transfer));
        }

        match classify(state, &response.status) {
            TransferStatus::Ok => {
                waits += 1;
                if waits >= limit {
                    tracing::warn!("Transfer {} answered WAIT {} times, giving up", cursor, waits);
                    return Ok(Outcome::Failed {
                        at: cursor,
                        status: TransferStatus::RetryExhausted,
                    });
                }
                tracing::debug!("Transfer {} answered WAIT, retry {}", cursor, waits);
            }
            status => return Ok(Outcome::Failed { at: cursor, status }),
        }
    }

    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::cmsisdap::mock::{MockAck, MockProbe};
    use crate::cmsisdap::WireProtocol;
    use crate::session::SessionStatus;

    const DRW: RegisterAddress = RegisterAddress::Ap { ap: 0, address: 0x0C };
    const TAR: RegisterAddress = RegisterAddress::Ap { ap: 0, address: 0x04 };
    const IDR: RegisterAddress = RegisterAddress::Ap { ap: 0, address: 0xFC };

    fn setup() -> (MockProbe, CmsisDap, SessionState, TransferEngine) {
        let mock = MockProbe::new();
        let probe = CmsisDap::new(Box::new(mock.clone()), Duration::from_millis(10));
        let state = SessionState {
            status: SessionStatus::Connected(WireProtocol::Swd),
            ..SessionState::default()
        };
        (mock, probe, state, TransferEngine::new())
    }

    fn config(wait_retry_limit: usize) -> TransferConfig {
        TransferConfig {
            wait_retry_limit,
            ..TransferConfig::default()
        }
    }

    #[test]
    fn ap_address_form() {
        assert_eq!(RegisterAddress::ap(0x0100_00FC).unwrap(), RegisterAddress::Ap { ap: 1, address: 0xFC });
        assert!(matches!(RegisterAddress::ap(0x0000_0101), Err(TransferError::InvalidAddress(_))));
        assert!(RegisterAddress::dp(0x2).is_err());
    }

    #[test]
    fn select_only_for_banked_registers() {
        assert_eq!(RegisterAddress::Dp(0x0).required_select(None), None);
        assert_eq!(RegisterAddress::Dp(0x24).required_select(Some(Select(0))), Some(Select(0x2)));
        assert_eq!(IDR.required_select(Some(Select(0xF0))), None);
        assert_eq!(DRW.required_select(Some(Select(0xF0))), Some(Select(0)));
    }

    #[test]
    fn select_written_once_for_same_bank() {
        let (mock, mut probe, mut state, mut engine) = setup();
        for _ in 0..3 {
            engine.queue(&state, 64, BatchCommand::Read(DRW)).unwrap();
        }
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();

        assert_eq!(responses.len(), 3);
        assert_eq!(mock.state().select_writes, vec![0]);
        assert_eq!(state.select_cache, Some(Select(0)));

        // The cache carries over to the next batch.
        engine.queue(&state, 64, BatchCommand::Read(TAR)).unwrap();
        engine.flush(&mut probe, &mut state, &config(16)).unwrap();
        assert_eq!(mock.state().select_writes.len(), 1);
    }

    #[test]
    fn bank_change_mid_batch_inserts_select() {
        let (mock, mut probe, mut state, mut engine) = setup();
        engine.queue(&state, 64, BatchCommand::Read(DRW)).unwrap();
        engine.queue(&state, 64, BatchCommand::Read(IDR)).unwrap();
        engine.queue(&state, 64, BatchCommand::Read(TAR)).unwrap();
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();

        assert_eq!(mock.state().select_writes, vec![0x00, 0xF0, 0x00]);
        assert_eq!(responses[1].value, Some(0x2477_0011));
        assert_eq!(responses.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn explicit_select_write_updates_projection() {
        let (mock, mut probe, mut state, mut engine) = setup();
        engine
            .queue(&state, 64, BatchCommand::Write(RegisterAddress::Dp(SELECT_ADDR), 0xF0))
            .unwrap();
        engine.queue(&state, 64, BatchCommand::Read(IDR)).unwrap();
        engine.flush(&mut probe, &mut state, &config(16)).unwrap();

        assert_eq!(mock.state().select_writes, vec![0xF0]);
        assert_eq!(state.select_cache, Some(Select(0xF0)));
    }

    #[test_case(15, TransferStatus::Ok; "fewer waits than the limit")]
    #[test_case(16, TransferStatus::RetryExhausted; "waits up to the limit")]
    fn wait_retry_limit(waits: usize, expected: TransferStatus) {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().acks.extend(std::iter::repeat(MockAck::Wait).take(waits));

        engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, expected);
        assert!(!state.sticky_error);
    }

    #[test]
    fn wait_retries_only_the_waiting_request() {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().acks.extend([MockAck::Ok, MockAck::Wait]);
        for _ in 0..3 {
            engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        }
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();
        assert!(responses.iter().all(|r| r.status == TransferStatus::Ok));

        let counts: Vec<u8> = mock
            .state()
            .frames
            .iter()
            .filter(|f| f[0] == 0x05)
            .map(|f| f[2])
            .collect();
        assert_eq!(counts, vec![3, 1, 1]);
    }

    #[test]
    fn fault_sets_sticky_and_aborts_the_rest() {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().acks.extend([MockAck::Ok, MockAck::Fault]);
        for _ in 0..4 {
            engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        }
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();

        let statuses: Vec<_> = responses.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                TransferStatus::Ok,
                TransferStatus::Fault,
                TransferStatus::Aborted,
                TransferStatus::Aborted
            ]
        );
        assert!(state.sticky_error);
        assert_eq!(state.select_cache, None);

        let frames = mock.state().frames.len();
        assert!(matches!(
            engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))),
            Err(TransferError::StickyErrorPending)
        ));
        assert!(matches!(
            engine.flush(&mut probe, &mut state, &config(16)),
            Err(TransferError::StickyErrorPending)
        ));
        assert_eq!(mock.state().frames.len(), frames);

        engine.clear_sticky_errors(&mut probe, &mut state).unwrap();
        assert_eq!(mock.state().abort_writes, vec![0x1E]);
        assert!(!state.sticky_error);
        engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
    }

    #[test]
    fn parity_error_is_a_fault() {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().acks.push_back(MockAck::Parity);
        engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();
        assert_eq!(responses[0].status, TransferStatus::Fault);
        assert!(state.sticky_error);
    }

    #[test]
    fn no_ack_requests_line_reset() {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().acks.push_back(MockAck::NoAck);
        engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();

        assert_eq!(responses[0].status, TransferStatus::NoResponse);
        assert_eq!(responses[1].status, TransferStatus::Aborted);
        assert!(state.line_reset_pending);
        assert!(!state.sticky_error);
    }

    #[test]
    fn failed_select_is_reported_on_the_request_needing_it() {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().acks.push_back(MockAck::Fault);
        engine.queue(&state, 64, BatchCommand::Read(DRW)).unwrap();
        let responses = engine.flush(&mut probe, &mut state, &config(16)).unwrap();
        assert_eq!(
            responses,
            vec![TransferResponse {
                index: 0,
                status: TransferStatus::Fault,
                value: None
            }]
        );
    }

    #[test]
    fn batch_full_on_packet_size() {
        let (_mock, _probe, state, mut engine) = setup();
        // 3 header bytes plus 5 per write leaves room for 12 writes in 64 bytes.
        for _ in 0..12 {
            engine
                .queue(&state, 64, BatchCommand::Write(RegisterAddress::Dp(0xC), 0))
                .unwrap();
        }
        assert!(matches!(
            engine.queue(&state, 64, BatchCommand::Write(RegisterAddress::Dp(0xC), 0)),
            Err(TransferError::BatchFull)
        ));
        assert_eq!(engine.len(), 12);
    }

    #[test]
    fn batch_full_on_response_size() {
        let (_mock, _probe, state, mut engine) = setup();
        // Reads are one byte out but four back.
        for _ in 0..15 {
            engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        }
        assert!(matches!(
            engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))),
            Err(TransferError::BatchFull)
        ));
    }

    #[test]
    fn batch_full_on_transfer_count() {
        let (_mock, _probe, state, mut engine) = setup();
        for _ in 0..MAX_TRANSFERS {
            engine.queue(&state, 4096, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        }
        assert!(matches!(
            engine.queue(&state, 4096, BatchCommand::Read(RegisterAddress::Dp(0x0))),
            Err(TransferError::BatchFull)
        ));
    }

    #[test]
    fn not_connected_fails_fast() {
        let (_mock, _probe, mut state, mut engine) = setup();
        state.status = SessionStatus::Disconnected;
        assert!(matches!(
            engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))),
            Err(TransferError::NotConnected)
        ));
    }

    #[test]
    fn transport_failure_is_session_fatal() {
        let (mock, mut probe, mut state, mut engine) = setup();
        mock.state().fail_at = Some((0x05, 0));
        state.select_cache = Some(Select(0));
        engine.queue(&state, 64, BatchCommand::Read(RegisterAddress::Dp(0x0))).unwrap();
        let err = engine.flush(&mut probe, &mut state, &config(16)).unwrap_err();
        assert!(err.is_session_fatal());
        assert_eq!(state.select_cache, None);
    }

    #[test]
    fn block_read_splits_into_packets() {
        let (mock, mut probe, mut state, mut engine) = setup();
        {
            let mut s = mock.state();
            s.csw = 0x2300_0052;
            s.load_memory(0, &(0u8..=119).collect::<Vec<_>>());
        }
        let words = engine
            .read_block(&mut probe, &mut state, &config(16), DRW, 30, None)
            .unwrap();

        assert_eq!(words.len(), 30);
        assert_eq!(words[0], 0x0302_0100);
        assert_eq!(words[29], 0x7776_7574);
        // 14 words per 64 byte packet.
        assert_eq!(mock.state().count(0x06), 3);
    }

    #[test]
    fn block_wait_rearms_and_resumes() {
        let (mock, mut probe, mut state, mut engine) = setup();
        {
            let mut s = mock.state();
            s.csw = 0x2300_0052;
            s.tar = 0x100;
            s.acks.extend([MockAck::Ok, MockAck::Ok, MockAck::Ok, MockAck::Wait]);
        }
        let data: Vec<u32> = (1..=6).collect();
        let resume = BlockResume {
            register: TAR,
            base: 0x100,
        };
        engine
            .write_block(&mut probe, &mut state, &config(16), DRW, &data, Some(resume))
            .unwrap();

        let s = mock.state();
        assert_eq!(s.tar_writes, vec![0x108]);
        assert_eq!(s.memory_at(0x100, 8), vec![1, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(s.memory_at(0x114, 4), vec![6, 0, 0, 0]);
    }

    #[test]
    fn block_wait_limit_counts_each_word() {
        let (mock, mut probe, mut state, mut engine) = setup();
        state.select_cache = Some(Select(0));
        {
            let mut s = mock.state();
            s.csw = 0x2300_0052;
            s.load_memory(0, &(0u8..16).collect::<Vec<_>>());
            s.acks.extend([
                MockAck::Ok,
                MockAck::Wait,
                MockAck::Ok,
                MockAck::Wait,
                MockAck::Ok,
                MockAck::Wait,
                MockAck::Ok,
            ]);
        }
        let words = engine
            .read_block(&mut probe, &mut state, &config(3), DRW, 4, None)
            .unwrap();

        assert_eq!(words.len(), 4);
        assert_eq!(mock.state().count(0x06), 4);
        assert!(!state.sticky_error);
    }

    #[test]
    fn block_fault_sets_sticky() {
        let (mock, mut probe, mut state, mut engine) = setup();
        state.select_cache = Some(Select(0));
        mock.state().acks.extend([MockAck::Ok, MockAck::Fault]);
        let err = engine
            .read_block(&mut probe, &mut state, &config(16), DRW, 4, None)
            .unwrap_err();
        assert!(matches!(err, TransferError::Fault));
        assert!(state.sticky_error);
    }
}
