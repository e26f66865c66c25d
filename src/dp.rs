//! Debug port addressing and register layouts.

/// Which DP on the wire a session talks to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DpAddress {
    /// The only DP, reached after a plain line reset.
    Default,
    /// A multi-drop SWD DP, reached by writing this value to TARGETSEL.
    Multidrop(u32),
}

impl From<Option<u32>> for DpAddress {
    fn from(target_sel: Option<u32>) -> Self {
        match target_sel {
            Some(id) => DpAddress::Multidrop(id),
            None => DpAddress::Default,
        }
    }
}

pub mod regs {
    use bitfield::bitfield;

    pub const ABORT_ADDR: u8 = 0x0;
    pub const DPIDR_ADDR: u8 = 0x0;
    pub const CTRL_ADDR: u8 = 0x4;
    pub const SELECT_ADDR: u8 = 0x8;
    pub const RDBUFF_ADDR: u8 = 0xC;

    bitfield! {
        /// ABORT, write-only. Each `*clr` bit clears one sticky flag in CTRL/STAT.
        #[derive(Copy, Clone, PartialEq, Eq)]
        pub struct Abort(u32);
        impl Debug;
        pub _, set_orunerrclr: 4;
        pub _, set_wderrclr: 3;
        pub _, set_stkerrclr: 2;
        pub _, set_stkcmpclr: 1;
        /// Abort the current AP transaction.
        pub _, set_dapabort: 0;
    }

    impl Abort {
        /// Clears every sticky flag, leaves any AP transaction running.
        pub fn clear_sticky() -> Self {
            let mut abort = Abort(0);
            abort.set_orunerrclr(true);
            abort.set_wderrclr(true);
            abort.set_stkerrclr(true);
            abort.set_stkcmpclr(true);
            abort
        }
    }

    bitfield! {
        /// CTRL/STAT, DP bank 0.
        #[derive(Copy, Clone, PartialEq, Eq)]
        pub struct Ctrl(u32);
        impl Debug;
        pub csyspwrupack, _: 31;
        pub csyspwrupreq, set_csyspwrupreq: 30;
        pub cdbgpwrupack, _: 29;
        pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
        pub cdbgrstack, _: 27;
        pub c_dbg_rst_req, set_c_dbg_rst_req: 26;
        pub u8, mask_lane, set_mask_lane: 11, 8;
        pub w_data_err, _: 7;
        pub read_ok, _: 6;
        pub sticky_err, _: 5;
        pub sticky_cmp, _: 4;
        pub u8, trn_mode, _: 3, 2;
        pub sticky_orun, _: 1;
        pub orun_detect, set_orun_detect: 0;
    }

    bitfield! {
        /// SELECT: AP and register banks for the accesses that follow.
        #[derive(Copy, Clone, PartialEq, Eq)]
        pub struct Select(u32);
        impl Debug;
        pub u8, ap_sel, set_ap_sel: 31, 24;
        pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
        /// Bank for DP register address 0x4.
        pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
    }

    bitfield! {
        /// DPIDR, read-only identification.
        #[derive(Copy, Clone, PartialEq, Eq)]
        pub struct DPIDR(u32);
        impl Debug;
        pub u8, revision, _: 31, 28;
        pub u8, part_no, _: 27, 20;
        pub min, _: 16;
        /// DP architecture version, 1 to 3.
        pub u8, version, _: 15, 12;
        pub u8, jep_cc, _: 11, 8;
        pub u8, jep_id, _: 7, 1;
    }
}
