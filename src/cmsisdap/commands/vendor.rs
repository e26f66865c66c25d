//! Vendor commands spoken by the probe's bootloader during a firmware update.
use scroll::{Pread, Pwrite, LE};

use super::{ensure_capacity, ensure_len, CommandId, FramingError, Request, Status};

/// Ask the running firmware to restart into its bootloader.
#[derive(Clone, Copy, Debug)]
pub struct EnterBootloaderRequest;

impl Request for EnterBootloaderRequest {
    const COMMAND_ID: CommandId = CommandId::EnterBootloader;

    type Response = Status;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, FramingError> {
        Ok(0)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Status::from_byte(buffer[0])
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HandshakeRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status: Status,
    pub version: u8,
    /// Largest chunk the bootloader accepts.
    pub chunk_size: u16,
    pub max_image_size: u32,
}

impl Request for HandshakeRequest {
    const COMMAND_ID: CommandId = CommandId::BootloaderHandshake;

    type Response = HandshakeResponse;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, FramingError> {
        Ok(0)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        let status = Status::from_byte(buffer[0])?;
        if status == Status::DapError {
            return Ok(HandshakeResponse {
                status,
                version: 0,
                chunk_size: 0,
                max_image_size: 0,
            });
        }
        ensure_len(buffer, 8)?;
        Ok(HandshakeResponse {
            status,
            version: buffer[1],
            chunk_size: buffer.pread_with(2, LE).map_err(|_| FramingError::UnexpectedAnswer)?,
            max_image_size: buffer.pread_with(4, LE).map_err(|_| FramingError::UnexpectedAnswer)?,
        })
    }
}

/// One slice of the image, placed at `offset`.
#[derive(Clone, Debug)]
pub struct WriteChunkRequest {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Command ID, offset and length byte.
pub const CHUNK_HEADER: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteChunkResponse {
    pub status: Status,
    pub offset: u32,
}

impl Request for WriteChunkRequest {
    const COMMAND_ID: CommandId = CommandId::FirmwareChunk;

    type Response = WriteChunkResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        if self.data.len() > u8::MAX as usize {
            return Err(FramingError::FrameTooLarge {
                size: CHUNK_HEADER + self.data.len(),
                max: CHUNK_HEADER + u8::MAX as usize,
            });
        }
        let size = CHUNK_HEADER - 1 + self.data.len();
        ensure_capacity(buffer, size)?;

        buffer
            .pwrite_with(self.offset, 0, LE)
            .map_err(|_| FramingError::UnexpectedAnswer)?;
        buffer[4] = self.data.len() as u8;
        buffer[5..size].copy_from_slice(&self.data);
        Ok(size)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        let status = Status::from_byte(buffer[0])?;
        ensure_len(buffer, 5)?;
        Ok(WriteChunkResponse {
            status,
            offset: buffer.pread_with(1, LE).map_err(|_| FramingError::UnexpectedAnswer)?,
        })
    }
}

/// CRC-32 of the first `length` bytes the bootloader received.
#[derive(Clone, Copy, Debug)]
pub struct ChecksumRequest {
    pub length: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChecksumResponse {
    pub status: Status,
    pub crc: u32,
}

impl Request for ChecksumRequest {
    const COMMAND_ID: CommandId = CommandId::FirmwareChecksum;

    type Response = ChecksumResponse;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, FramingError> {
        ensure_capacity(buffer, 4)?;
        buffer[..4].copy_from_slice(&self.length.to_le_bytes());
        Ok(4)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        let status = Status::from_byte(buffer[0])?;
        ensure_len(buffer, 5)?;
        Ok(ChecksumResponse {
            status,
            crc: buffer.pread_with(1, LE).map_err(|_| FramingError::UnexpectedAnswer)?,
        })
    }
}

/// Leave the bootloader and start the freshly written image.
#[derive(Clone, Copy, Debug)]
pub struct RebootRequest;

impl Request for RebootRequest {
    const COMMAND_ID: CommandId = CommandId::BootloaderReboot;

    type Response = Status;

    fn to_bytes(&self, _buffer: &mut [u8]) -> Result<usize, FramingError> {
        Ok(0)
    }

    fn parse_response(&self, buffer: &[u8]) -> Result<Self::Response, FramingError> {
        Status::from_byte(buffer[0])
    }
}
