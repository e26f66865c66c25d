#![recursion_limit = "256"] // required by bitfield!
#![deny(unused_must_use)]

//! Host-side driver for CMSIS-DAP debug probes: command framing, SWD/JTAG
//! line sequences, batched DP/AP transfers, target memory access and the
//! vendor firmware update.

pub mod ap;
pub mod cmsisdap;
pub mod config;
pub mod dp;
pub mod firmware;
pub mod sequence;
pub mod session;
pub mod transfer;

pub use cmsisdap::{CmsisDap, WireProtocol};
pub use config::Config;
pub use session::{DebugAccessError, Session, SessionError, SessionStatus};
