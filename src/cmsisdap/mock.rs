//! A simulated CMSIS-DAP probe with one target behind it.
//!
//! Frames are decoded the way firmware would, so tests exercise the real
//! encoders. Register accesses are answered from a small DP/MEM-AP model.
use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use super::commands::{SendError, Transport, TransportError};

/// Scripted acknowledge for the next register access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockAck {
    Ok,
    Wait,
    Fault,
    NoAck,
    Parity,
}

pub(crate) struct MockState {
    pub packet_size: usize,
    /// First byte of the capability bitmap.
    pub capabilities: u8,
    pub protocol_version: String,
    /// Never answer anything.
    pub silent: bool,
    /// Answer this many `DAP_Connect` with a failure first.
    pub connect_failures: usize,
    pub connected_port: Option<u8>,
    pub clock_hz: Option<u32>,
    pub swj_sequences: Vec<(u8, Vec<u8>)>,
    pub jtag_sequences: usize,
    /// Every frame written, in order.
    pub frames: Vec<Vec<u8>>,
    /// Consumed by register accesses; an empty queue means OK.
    pub acks: VecDeque<MockAck>,
    /// Fail the n-th (zero based) write of a frame with this opcode.
    pub fail_at: Option<(u8, usize)>,
    /// Echo a wrong opcode on the next response.
    pub corrupt_next: bool,

    pub dpidr: u32,
    pub ctrl_stat: u32,
    pub power_up_acks: bool,
    pub select: u32,
    pub select_writes: Vec<u32>,
    pub abort_writes: Vec<u32>,
    pub sticky: bool,
    pub rdbuff: u32,
    pub ap_regs: BTreeMap<(u8, u8), u32>,
    pub csw: u32,
    pub tar: u32,
    pub tar_writes: Vec<u32>,
    pub memory: BTreeMap<u32, u8>,

    pub bootloader: bool,
    pub bootloader_chunk_size: u16,
    pub image: Vec<u8>,
    pub checksum_override: Option<u32>,
    pub reboots: usize,

    pending: VecDeque<Vec<u8>>,
}

impl MockState {
    pub fn opcodes(&self) -> Vec<u8> {
        self.frames.iter().filter_map(|f| f.first().copied()).collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.frames.iter().filter(|f| f.first() == Some(&opcode)).count()
    }

    pub fn load_memory(&mut self, address: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    pub fn memory_at(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.memory.get(&(address + i as u32)).copied().unwrap_or(0))
            .collect()
    }

    fn next_ack(&mut self) -> MockAck {
        self.acks.pop_front().unwrap_or(MockAck::Ok)
    }

    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let opcode = frame[0];
        let body = &frame[1..];
        let mut out = vec![opcode];
        match opcode {
            0x00 => out.extend(self.info(body[0])),
            0x01 => out.push(0),
            0x02 => {
                let result = if self.connect_failures > 0 {
                    self.connect_failures -= 1;
                    0
                } else {
                    match body[0] {
                        0 if self.capabilities & 1 != 0 => 1,
                        0 if self.capabilities & 2 != 0 => 2,
                        1 if self.capabilities & 1 != 0 => 1,
                        2 if self.capabilities & 2 != 0 => 2,
                        _ => 0,
                    }
                };
                self.connected_port = (result != 0).then_some(result);
                out.push(result);
            }
            0x03 => {
                self.connected_port = None;
                out.push(0);
            }
            0x04 | 0x13 | 0x15 => out.push(0),
            0x05 => out.extend(self.transfer(body)),
            0x06 => out.extend(self.transfer_block(body)),
            0x07 => return None,
            0x08 => {
                let value = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
                self.write_abort(value);
                out.push(0);
            }
            0x0A => out.extend([0, 1]),
            0x10 => out.push(body[0] | !body[1]),
            0x11 => {
                self.clock_hz = Some(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
                out.push(0);
            }
            0x12 => {
                let bits = if body[0] == 0 { 256 } else { body[0] as usize };
                self.swj_sequences.push((body[0], body[1..1 + bits.div_ceil(8)].to_vec()));
                out.push(0);
            }
            0x14 => {
                self.jtag_sequences += 1;
                out.push(0);
                let mut offset = 1;
                for _ in 0..body[0] {
                    let info = body[offset];
                    let cycles = match info & 0x3F {
                        0 => 64,
                        n => n as usize,
                    };
                    offset += 1 + cycles.div_ceil(8);
                    if info & 0x80 != 0 {
                        out.extend(std::iter::repeat(0).take(cycles.div_ceil(8)));
                    }
                }
            }
            0x80 => {
                self.bootloader = true;
                out.push(0);
            }
            0x81 => {
                if self.bootloader {
                    out.extend([0, 1]);
                    out.extend(self.bootloader_chunk_size.to_le_bytes());
                    out.extend(0x1_0000u32.to_le_bytes());
                } else {
                    out.push(0xFF);
                }
            }
            0x82 => {
                let offset = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let len = body[4] as usize;
                if self.bootloader && offset as usize == self.image.len() {
                    self.image.extend_from_slice(&body[5..5 + len]);
                    out.push(0);
                } else {
                    out.push(0xFF);
                }
                out.extend(offset.to_le_bytes());
            }
            0x83 => {
                let len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
                let crc = self
                    .checksum_override
                    .unwrap_or_else(|| crc::crc32::checksum_ieee(&self.image[..len.min(self.image.len())]));
                out.push(0);
                out.extend(crc.to_le_bytes());
            }
            0x84 => {
                self.reboots += 1;
                self.bootloader = false;
                out.push(0);
            }
            _ => out = vec![0xFF],
        }
        Some(out)
    }

    fn info(&self, id: u8) -> Vec<u8> {
        let string = |s: &str| {
            let mut v = vec![s.len() as u8 + 1];
            v.extend(s.as_bytes());
            v.push(0);
            v
        };
        match id {
            0x01 => string("NXP"),
            0x02 => string("MCU-LINK"),
            0x03 => string("ABC123"),
            0x04 => string(&self.protocol_version),
            0x09 => string("3.128"),
            0xF0 => vec![2, self.capabilities, 0],
            0xFD => {
                let mut v = vec![4];
                v.extend(4096u32.to_le_bytes());
                v
            }
            0xFE => vec![1, 4],
            0xFF => {
                let mut v = vec![2];
                v.extend((self.packet_size as u16).to_le_bytes());
                v
            }
            _ => vec![0],
        }
    }

    fn transfer(&mut self, body: &[u8]) -> Vec<u8> {
        let count = body[1] as usize;
        let mut offset = 2;
        let mut done = 0;
        let mut data = Vec::new();
        let mut status = 1;

        for _ in 0..count {
            let request = body[offset];
            offset += 1;
            let value = if request & 0x2 == 0 {
                let v = u32::from_le_bytes([body[offset], body[offset + 1], body[offset + 2], body[offset + 3]]);
                offset += 4;
                Some(v)
            } else {
                None
            };

            match self.access(request, value) {
                Ok(Some(read)) => data.extend(read.to_le_bytes()),
                Ok(None) => (),
                Err(code) => {
                    status = code;
                    break;
                }
            }
            done += 1;
        }

        let mut out = vec![done as u8, status];
        out.extend(data);
        out
    }

    fn transfer_block(&mut self, body: &[u8]) -> Vec<u8> {
        let count = u16::from_le_bytes([body[1], body[2]]) as usize;
        let request = body[3];
        let mut done = 0u16;
        let mut data = Vec::new();
        let mut status = 1;

        for i in 0..count {
            let value = if request & 0x2 == 0 {
                let o = 4 + 4 * i;
                Some(u32::from_le_bytes([body[o], body[o + 1], body[o + 2], body[o + 3]]))
            } else {
                None
            };
            match self.access(request, value) {
                Ok(Some(read)) => data.extend(read.to_le_bytes()),
                Ok(None) => (),
                Err(code) => {
                    status = code;
                    break;
                }
            }
            done += 1;
        }

        let mut out = done.to_le_bytes().to_vec();
        out.push(status);
        out.extend(data);
        out
    }

    /// One register access; `Err` carries the status byte of a failed one.
    fn access(&mut self, request: u8, value: Option<u32>) -> Result<Option<u32>, u8> {
        let ap = request & 0x1 != 0;
        match self.next_ack() {
            MockAck::Ok => (),
            MockAck::Wait => return Err(0x02),
            MockAck::Fault => {
                self.sticky = true;
                return Err(0x04);
            }
            MockAck::NoAck => return Err(0x07),
            MockAck::Parity => return Err(0x08),
        }
        if ap && self.sticky {
            return Err(0x04);
        }

        let a = request & 0x0C;
        Ok(match (ap, value) {
            (false, None) => Some(self.dp_read(a)),
            (false, Some(v)) => {
                self.dp_write(a, v);
                None
            }
            (true, None) => {
                let v = self.ap_read(a);
                self.rdbuff = v;
                Some(v)
            }
            (true, Some(v)) => {
                self.ap_write(a, v);
                None
            }
        })
    }

    fn dp_read(&mut self, a: u8) -> u32 {
        match a {
            0x0 => self.dpidr,
            0x4 => {
                let mut v = self.ctrl_stat;
                if self.power_up_acks {
                    if v & (1 << 30) != 0 {
                        v |= 1 << 31;
                    }
                    if v & (1 << 28) != 0 {
                        v |= 1 << 29;
                    }
                }
                if self.sticky {
                    v |= 1 << 5;
                }
                v
            }
            0x8 => self.select,
            _ => self.rdbuff,
        }
    }

    fn dp_write(&mut self, a: u8, v: u32) {
        match a {
            0x0 => self.write_abort(v),
            0x4 => self.ctrl_stat = v & 0x5000_0F01,
            0x8 => {
                self.select = v;
                self.select_writes.push(v);
            }
            _ => (),
        }
    }

    fn write_abort(&mut self, v: u32) {
        self.abort_writes.push(v);
        if v & 0x4 != 0 {
            self.sticky = false;
        }
    }

    fn ap_address(&self, a: u8) -> (u8, u8) {
        ((self.select >> 24) as u8, ((self.select as u8) & 0xF0) | a)
    }

    fn ap_read(&mut self, a: u8) -> u32 {
        match self.ap_address(a) {
            (0, 0x00) => self.csw,
            (0, 0x04) => self.tar,
            (0, 0x0C) => {
                let base = self.tar & !3;
                let word = u32::from_le_bytes([
                    self.memory.get(&base).copied().unwrap_or(0),
                    self.memory.get(&(base + 1)).copied().unwrap_or(0),
                    self.memory.get(&(base + 2)).copied().unwrap_or(0),
                    self.memory.get(&(base + 3)).copied().unwrap_or(0),
                ]);
                self.increment_tar();
                word
            }
            (0, 0xFC) => 0x2477_0011,
            key => self.ap_regs.get(&key).copied().unwrap_or(0),
        }
    }

    fn ap_write(&mut self, a: u8, v: u32) {
        match self.ap_address(a) {
            (0, 0x00) => self.csw = v,
            (0, 0x04) => {
                self.tar = v;
                self.tar_writes.push(v);
            }
            (0, 0x0C) => {
                if self.csw & 0x7 == 0 {
                    let lane = self.tar & 3;
                    self.memory.insert(self.tar, (v >> (lane * 8)) as u8);
                } else {
                    let base = self.tar & !3;
                    for (i, b) in v.to_le_bytes().into_iter().enumerate() {
                        self.memory.insert(base + i as u32, b);
                    }
                }
                self.increment_tar();
            }
            key => {
                self.ap_regs.insert(key, v);
            }
        }
    }

    fn increment_tar(&mut self) {
        if (self.csw >> 4) & 0x3 != 1 {
            return;
        }
        let step = 1 << (self.csw & 0x7);
        // Hardware only increments the low 10 bits.
        self.tar = (self.tar & !0x3FF) | (self.tar.wrapping_add(step) & 0x3FF);
    }
}

#[derive(Clone)]
pub(crate) struct MockProbe {
    state: Rc<RefCell<MockState>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState {
                packet_size: 64,
                capabilities: 0x03,
                protocol_version: "2.1.0".to_owned(),
                silent: false,
                connect_failures: 0,
                connected_port: None,
                clock_hz: None,
                swj_sequences: Vec::new(),
                jtag_sequences: 0,
                frames: Vec::new(),
                acks: VecDeque::new(),
                fail_at: None,
                corrupt_next: false,
                dpidr: 0x2BA0_1477,
                ctrl_stat: 0,
                power_up_acks: true,
                select: 0,
                select_writes: Vec::new(),
                abort_writes: Vec::new(),
                sticky: false,
                rdbuff: 0,
                ap_regs: BTreeMap::new(),
                csw: 0,
                tar: 0,
                tar_writes: Vec::new(),
                memory: BTreeMap::new(),
                bootloader: false,
                bootloader_chunk_size: 32,
                image: Vec::new(),
                checksum_override: None,
                reboots: 0,
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn state(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }
}

impl Transport for MockProbe {
    fn write(&mut self, frame: &[u8]) -> Result<(), SendError> {
        let mut state = self.state.borrow_mut();
        let opcode = frame[0];
        let seen = state.count(opcode);
        state.frames.push(frame.to_vec());

        if state.fail_at == Some((opcode, seen)) {
            return Err(TransportError::Disconnected.into());
        }
        if state.silent {
            return Ok(());
        }
        if let Some(mut response) = state.respond(frame) {
            if std::mem::take(&mut state.corrupt_next) {
                response[0] ^= 0x40;
            }
            state.pending.push_back(response);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, SendError> {
        let mut state = self.state.borrow_mut();
        match state.pending.pop_front() {
            Some(response) => {
                let n = response.len().min(buf.len());
                buf[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            None => Err(SendError::Timeout),
        }
    }

    fn drain(&mut self) {
        self.state.borrow_mut().pending.clear();
    }

    fn packet_size(&self) -> usize {
        self.state.borrow().packet_size
    }

    fn set_packet_size(&mut self, packet_size: usize) {
        self.state.borrow_mut().packet_size = packet_size;
    }
}
