use scroll::{Pwrite, LE};

use super::super::{ensure_capacity, CommandId, FramingError, Request};

bitfield::bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Pins(u8);
    impl Debug;
    pub nreset, set_nreset: 7;
    pub ntrst, set_ntrst: 5;
    pub tdo, set_tdo: 3;
    pub tdi, set_tdi: 2;
    pub swdio_tms, set_swdio_tms: 1;
    pub swclk_tck, set_swclk_tck: 0;
}

/// `DAP_SWJ_Pins`: drive the selected pins and read all of them back.
#[derive(Clone, Copy, Debug)]
pub struct SWJPinsRequest {
    pub output: Pins,
    pub select: Pins,
    /// Microseconds to wait for the selected pins to settle.
    pub wait: u32,
}

#[derive(Debug, Default)]
pub struct SWJPinsRequestBuilder {
    nreset: Option<bool>,
    ntrst: Option<bool>,
    wait: u32,
}

impl SWJPinsRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nreset(&mut self, value: bool) -> &mut Self {
        self.nreset = Some(value);
        self
    }

    pub fn ntrst(&mut self, value: bool) -> &mut Self {
        self.ntrst = Some(value);
        self
    }

    pub fn wait(&mut self, micros: u32) -> &mut Self {
        self.wait = micros;
        self
    }

    pub fn build(&self) -> SWJPinsRequest {
        let mut select = Pins(0);
        let mut output = Pins(0);

        if let Some(nreset) = self.nreset {
            select.set_nreset(true);
            output.set_nreset(nreset);
        }
        if let Some(ntrst) = self.ntrst {
            select.set_ntrst(true);
            output.set_ntrst(ntrst);
        }

        SWJPinsRequest {
            output,
            select,
            wait: self.wait,
        }
    }
}

impl Request for SWJPinsRequest {
    const COMMAND_ID: CommandId = CommandId::SwjPins;

    type Response = SWJPinsResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, 6)?;
        buffer[0] = self.output.0;
        buffer[1] = self.select.0;
        buffer
            .pwrite_with(self.wait, 2, LE)
            .map_err(|_| FramingError::UnexpectedAnswer)?;
        Ok(6)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Ok(Pins(buffer[0]))
    }
}

pub type SWJPinsResponse = Pins;
