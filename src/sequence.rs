//! SWD/JTAG line sequences sent with `DAP_SWJ_Sequence` and `DAP_JTAG_Sequence`.
use bitvec::prelude::*;

use crate::cmsisdap::commands::jtag::sequence::{Sequence, SequenceRequest};
use crate::cmsisdap::commands::{parity, CmsisDapError};
use crate::cmsisdap::{CmsisDap, WireProtocol};
use crate::dp::DpAddress;

/// SWDIO high for 51 cycles.
const LINE_RESET_BITS: u8 = 51;
const LINE_RESET: u64 = 0x0007_FFFF_FFFF_FFFF;

/// Idle cycles after the line reset that completes a switch sequence.
const IDLE_AFTER_RESET: u8 = 2;

const JTAG_TO_SWD: u64 = 0xE79E;
const SWD_TO_JTAG: u64 = 0xE73C;
const JTAG_TO_DORMANT: u64 = 0x33BB_BBBA;
const ALERT: [u64; 2] = [0x8685_2D95_6209_F392, 0x19BC_0EA2_E3DD_AFE9];
/// 4 cycles low, then the SWD activation code 0x1A.
const SWD_ACTIVATION: u64 = 0x1A0;

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("multi-drop target selection is only possible over SWD")]
    MultidropNeedsSwd,
    #[error(transparent)]
    Probe(#[from] CmsisDapError),
}

/// Sends line sequences for the protocol in use.
pub struct SequenceEngine<'a> {
    probe: &'a mut CmsisDap,
    protocol: WireProtocol,
}

impl<'a> SequenceEngine<'a> {
    pub fn new(probe: &'a mut CmsisDap, protocol: WireProtocol) -> Self {
        Self { probe, protocol }
    }

    /// Perform a SWD line reset (SWDIO high for 51 clock cycles)
    ///
    /// After the line reset, SWDIO will be kept low for `idle_cycles` cycles.
    pub fn line_reset(&mut self, idle_cycles: u8) -> Result<(), CmsisDapError> {
        tracing::debug!("Performing SWD line reset");
        if idle_cycles <= 64 - LINE_RESET_BITS {
            self.probe.swj_sequence(LINE_RESET_BITS + idle_cycles, LINE_RESET)
        } else {
            self.probe.swj_sequence(LINE_RESET_BITS, LINE_RESET)?;
            self.idle(idle_cycles as usize)
        }
    }

    /// Clock `cycles` with SWDIO/TMS low.
    pub fn idle(&mut self, cycles: usize) -> Result<(), CmsisDapError> {
        let mut left = cycles;
        while left > 0 {
            let n = left.min(64);
            self.probe.swj_sequence(n as u8, 0)?;
            left -= n;
        }
        Ok(())
    }

    pub fn jtag_to_swd(&mut self) -> Result<(), CmsisDapError> {
        tracing::debug!("Switching SWJ-DP from JTAG to SWD");
        self.line_reset(0)?;
        self.probe.swj_sequence(16, JTAG_TO_SWD)?;
        self.line_reset(IDLE_AFTER_RESET)
    }

    /// Ends in Run-Test/Idle.
    pub fn swd_to_jtag(&mut self) -> Result<(), CmsisDapError> {
        tracing::debug!("Switching SWJ-DP from SWD to JTAG");
        self.line_reset(0)?;
        self.probe.swj_sequence(16, SWD_TO_JTAG)?;
        // 5 cycles TMS high to Test-Logic-Reset, one low to Run-Test/Idle.
        self.probe.swj_sequence(6, 0x1F)
    }

    /// Wake a dormant SWD DP, leaving the line reset and idle.
    pub fn dormant_to_swd(&mut self) -> Result<(), CmsisDapError> {
        self.line_reset(0)?;

        tracing::debug!("Select Dormant State (from JTAG)");
        self.probe.swj_sequence(31, JTAG_TO_DORMANT)?;

        tracing::trace!("Sending Selection Alert sequence");
        // Ensure target is not in the middle of detecting a selection alert
        self.probe.swj_sequence(8, 0xFF)?;
        for part in ALERT {
            self.probe.swj_sequence(64, part)?;
        }

        self.probe.swj_sequence(12, SWD_ACTIVATION)?;
        self.line_reset(IDLE_AFTER_RESET)
    }

    /// Write TARGETSEL. Targets never acknowledge this write, and many probes
    /// skip the data phase without an ACK, so it goes out as a raw sequence:
    /// request byte, turnaround and ACK cycles, then the data and its parity.
    pub fn target_select(&mut self, target_sel: u32) -> Result<(), CmsisDapError> {
        tracing::debug!("Writing targetsel {:#x}", target_sel);
        let data = (parity(target_sel) as u64) << 45 | (target_sel as u64) << 13 | 0x1f99;
        self.probe.swj_sequence(6 * 8, data)
    }

    /// Reset the TAP and park it in Run-Test/Idle.
    pub fn jtag_tap_reset(&mut self) -> Result<(), CmsisDapError> {
        tracing::debug!("Resetting JTAG TAP");
        let tdi = bitvec![u8, Lsb0; 1; 5];
        let sequences = vec![Sequence::no_capture(true, &tdi)?, Sequence::no_capture(false, &tdi[..1])?];
        self.probe.send_jtag_sequences(SequenceRequest::new(sequences)?)?;
        Ok(())
    }

    /// Bring the line into the state the DP at `dp` can be talked to in.
    #[tracing::instrument(skip(self), fields(protocol = %self.protocol))]
    pub fn connect(&mut self, dp: DpAddress) -> Result<(), SequenceError> {
        match (self.protocol, dp) {
            (WireProtocol::Swd, DpAddress::Default) => self.jtag_to_swd()?,
            (WireProtocol::Swd, DpAddress::Multidrop(target_sel)) => {
                self.dormant_to_swd()?;
                self.target_select(target_sel)?;
                self.idle(IDLE_AFTER_RESET as usize)?;
            }
            (WireProtocol::Jtag, DpAddress::Default) => {
                self.swd_to_jtag()?;
                self.jtag_tap_reset()?;
            }
            (WireProtocol::Jtag, DpAddress::Multidrop(_)) => return Err(SequenceError::MultidropNeedsSwd),
        }
        Ok(())
    }
}
