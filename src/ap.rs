//! MEM-AP registers and access planning.
use crate::transfer::RegisterAddress;

pub const CSW_ADDR: u8 = 0x00;
pub const TAR_ADDR: u8 = 0x04;
pub const DRW_ADDR: u8 = 0x0C;
pub const IDR_ADDR: u8 = 0xFC;

/// TAR auto-increment is only guaranteed within an aligned 1 KiB window.
pub const TAR_WRAP: u32 = 0x400;

bitfield::bitfield! {
    /// CSW, control and status word.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Csw(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub spiden, _: 23;
    pub u8, mode, set_mode: 11, 8;
    pub tr_in_prog, _: 7;
    pub device_en, set_device_en: 6;
    /// 0 off, 1 single, 2 packed.
    pub u8, addr_inc, set_addr_inc: 5, 4;
    /// 0 byte, 1 halfword, 2 word.
    pub u8, size, set_size: 2, 0;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataSize {
    U8 = 0,
    U32 = 2,
}

impl Csw {
    /// Default debug access with single auto-increment.
    pub fn for_size(size: DataSize) -> Self {
        let mut csw = Csw(0x2300_0000);
        csw.set_device_en(true);
        csw.set_addr_inc(1);
        csw.set_size(size as u8);
        csw
    }
}

/// A memory access port, `index` being its APSEL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryAp {
    pub index: u8,
}

impl MemoryAp {
    pub fn new(index: u8) -> Self {
        Self { index }
    }

    pub fn csw(&self) -> RegisterAddress {
        self.register(CSW_ADDR)
    }

    pub fn tar(&self) -> RegisterAddress {
        self.register(TAR_ADDR)
    }

    pub fn drw(&self) -> RegisterAddress {
        self.register(DRW_ADDR)
    }

    pub fn register(&self, address: u8) -> RegisterAddress {
        RegisterAddress::Ap {
            ap: self.index,
            address,
        }
    }
}

/// One contiguous piece of a memory access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Span {
    /// A single byte through the lane selected by `address & 3`.
    Byte { address: u32 },
    /// `words` aligned words starting at `address`, all inside one TAR window.
    Words { address: u32, words: usize },
}

/// Split `[address, address + len)` into byte accesses for the unaligned
/// edges and word runs that never cross a [`TAR_WRAP`] boundary.
pub fn plan(address: u32, len: usize) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut addr = address as u64;
    let end = address as u64 + len as u64;

    while addr < end && addr % 4 != 0 {
        spans.push(Span::Byte { address: addr as u32 });
        addr += 1;
    }

    let word_end = end & !3;
    while addr < word_end {
        let window_end = ((addr / TAR_WRAP as u64) + 1) * TAR_WRAP as u64;
        let run_end = window_end.min(word_end);
        spans.push(Span::Words {
            address: addr as u32,
            words: ((run_end - addr) / 4) as usize,
        });
        addr = run_end;
    }

    while addr < end {
        spans.push(Span::Byte { address: addr as u32 });
        addr += 1;
    }

    spans
}

/// Shift for the byte lane `address` uses on the 32-bit data bus.
pub fn lane_shift(address: u32) -> u32 {
    (address & 3) * 8
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn csw_for_word_access() {
        assert_eq!(Csw::for_size(DataSize::U32).0, 0x2300_0052);
        assert_eq!(Csw::for_size(DataSize::U8).0, 0x2300_0050);
    }

    #[test]
    fn aligned_access_is_one_run() {
        assert_eq!(plan(0x2000_0000, 16), vec![Span::Words { address: 0x2000_0000, words: 4 }]);
    }

    #[test]
    fn unaligned_edges_use_bytes() {
        assert_eq!(
            plan(0x1001, 9),
            vec![
                Span::Byte { address: 0x1001 },
                Span::Byte { address: 0x1002 },
                Span::Byte { address: 0x1003 },
                Span::Words { address: 0x1004, words: 1 },
                Span::Byte { address: 0x1008 },
                Span::Byte { address: 0x1009 },
            ]
        );
    }

    #[test]
    fn runs_split_at_tar_wrap() {
        assert_eq!(
            plan(0x3F8, 16),
            vec![
                Span::Words { address: 0x3F8, words: 2 },
                Span::Words { address: 0x400, words: 2 },
            ]
        );
    }

    #[test]
    fn small_unaligned_access_stays_bytes() {
        assert_eq!(plan(0x5, 2), vec![Span::Byte { address: 0x5 }, Span::Byte { address: 0x6 }]);
        assert!(plan(0x5, 0).is_empty());
    }

    #[test]
    fn lanes() {
        assert_eq!(lane_shift(0x1000), 0);
        assert_eq!(lane_shift(0x1003), 24);
    }
}
