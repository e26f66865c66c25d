//! Probe firmware update over the vendor bootloader commands.
use std::thread;
use std::time::Duration;

use crate::cmsisdap::commands::vendor::{
    ChecksumRequest, EnterBootloaderRequest, HandshakeRequest, HandshakeResponse, RebootRequest, WriteChunkRequest,
    CHUNK_HEADER,
};
use crate::cmsisdap::commands::{CmsisDapError, CommandId, Status};
use crate::cmsisdap::CmsisDap;
use crate::config::FirmwareConfig;

/// An image and the CRC-32 the bootloader must report for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    checksum: u32,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>) -> Result<Self, FirmwareError> {
        if data.is_empty() {
            return Err(FirmwareError::EmptyImage);
        }
        let checksum = crc::crc32::checksum_ieee(&data);
        Ok(Self { data, checksum })
    }

    /// Like [`FirmwareImage::new`], but the image must match `expected`.
    pub fn with_checksum(data: Vec<u8>, expected: u32) -> Result<Self, FirmwareError> {
        let image = Self::new(data)?;
        if image.checksum != expected {
            return Err(FirmwareError::ImageChecksum {
                expected,
                actual: image.checksum,
            });
        }
        Ok(image)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, docsplay::Display)]
pub enum UpdateState {
    /// idle
    Idle,
    /// waiting for the bootloader
    BootloaderHandshake,
    /// transferring the image
    Transferring,
    /// verifying the image
    Verifying,
    /// failed
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("the firmware image is empty")]
    EmptyImage,
    #[error("image checksum is {actual:#010x}, expected {expected:#010x}")]
    ImageChecksum { expected: u32, actual: u32 },
    #[error("the bootloader did not answer after {attempts} attempts")]
    HandshakeFailed { attempts: usize },
    #[error("the image is {size} bytes, the bootloader takes at most {max}")]
    ImageTooLarge { size: usize, max: u32 },
    #[error("the bootloader rejected {0:?}")]
    Rejected(CommandId),
    #[error("chunk at offset {expected:#x} was acknowledged for offset {received:#x}")]
    OffsetMismatch { expected: u32, received: u32 },
    #[error("the probe reports checksum {actual:#010x}, expected {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error(transparent)]
    Probe(#[from] CmsisDapError),
}

#[derive(Debug, thiserror::Error)]
#[error("firmware update failed while {stage}")]
pub struct FirmwareUpdateFailed {
    pub stage: UpdateState,
    #[source]
    pub source: FirmwareError,
}

/// Owns the probe for the duration of an update; nothing else can talk to it.
#[derive(Debug)]
pub struct FirmwareUpdater {
    probe: CmsisDap,
    config: FirmwareConfig,
    state: UpdateState,
}

impl FirmwareUpdater {
    pub fn new(probe: CmsisDap, config: FirmwareConfig) -> Self {
        Self {
            probe,
            config,
            state: UpdateState::Idle,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn into_probe(self) -> CmsisDap {
        self.probe
    }

    /// Write `image` and reboot into it once the probe's checksum matches.
    ///
    /// No reboot is sent after any failure.
    #[tracing::instrument(skip_all, fields(size = image.data.len()))]
    pub fn update(&mut self, image: &FirmwareImage) -> Result<(), FirmwareUpdateFailed> {
        match self.run(image) {
            Ok(()) => {
                self.state = UpdateState::Idle;
                tracing::info!("Firmware updated, probe rebooting");
                Ok(())
            }
            Err(source) => {
                let stage = self.state;
                self.state = UpdateState::Failed;
                tracing::warn!("Firmware update failed while {}: {}", stage, source);
                Err(FirmwareUpdateFailed { stage, source })
            }
        }
    }

    fn run(&mut self, image: &FirmwareImage) -> Result<(), FirmwareError> {
        self.state = UpdateState::BootloaderHandshake;
        if self.probe.send(&EnterBootloaderRequest)? == Status::DapError {
            return Err(FirmwareError::Rejected(CommandId::EnterBootloader));
        }
        let handshake = self.handshake()?;
        tracing::debug!("Bootloader handshake: {:?}", handshake);
        if image.data.len() > handshake.max_image_size as usize {
            return Err(FirmwareError::ImageTooLarge {
                size: image.data.len(),
                max: handshake.max_image_size,
            });
        }

        self.state = UpdateState::Transferring;
        let chunk_size = self
            .config
            .chunk_size
            .min(handshake.chunk_size as usize)
            .min(self.probe.packet_size().saturating_sub(CHUNK_HEADER))
            .min(u8::MAX as usize)
            .max(1);
        let chunks = image.data.len().div_ceil(chunk_size);
        tracing::debug!("Sending {} chunks of up to {} bytes", chunks, chunk_size);

        for (i, chunk) in image.data.chunks(chunk_size).enumerate() {
            let offset = (i * chunk_size) as u32;
            let response = self.probe.send(&WriteChunkRequest {
                offset,
                data: chunk.to_vec(),
            })?;
            if response.status == Status::DapError {
                return Err(FirmwareError::Rejected(CommandId::FirmwareChunk));
            }
            if response.offset != offset {
                return Err(FirmwareError::OffsetMismatch {
                    expected: offset,
                    received: response.offset,
                });
            }
            tracing::trace!("Chunk {} of {} acknowledged", i + 1, chunks);
        }

        self.state = UpdateState::Verifying;
        let response = self.probe.send(&ChecksumRequest {
            length: image.data.len() as u32,
        })?;
        if response.status == Status::DapError {
            return Err(FirmwareError::Rejected(CommandId::FirmwareChecksum));
        }
        if response.crc != image.checksum {
            return Err(FirmwareError::ChecksumMismatch {
                expected: image.checksum,
                actual: response.crc,
            });
        }

        if self.probe.send(&RebootRequest)? == Status::DapError {
            return Err(FirmwareError::Rejected(CommandId::BootloaderReboot));
        }
        Ok(())
    }

    /// The probe restarts into its bootloader, so the first handshakes may go unanswered.
    fn handshake(&mut self) -> Result<HandshakeResponse, FirmwareError> {
        let attempts = self.config.handshake_attempts.max(1);
        let delay = Duration::from_millis(self.config.handshake_delay_ms);

        for attempt in 1..=attempts {
            match self.probe.send(&HandshakeRequest) {
                Ok(response) if response.status == Status::DapOk => return Ok(response),
                Ok(_) => tracing::debug!("Bootloader not ready, attempt {} of {}", attempt, attempts),
                Err(e) => {
                    tracing::debug!("Handshake attempt {} of {} failed: {}", attempt, attempts, e);
                    self.probe.drain();
                }
            }
            if attempt < attempts {
                thread::sleep(delay);
            }
        }

        Err(FirmwareError::HandshakeFailed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cmsisdap::mock::MockProbe;

    fn updater(config: FirmwareConfig) -> (MockProbe, FirmwareUpdater) {
        let mock = MockProbe::new();
        let probe = CmsisDap::new(Box::new(mock.clone()), Duration::from_millis(10));
        (mock, FirmwareUpdater::new(probe, config))
    }

    fn config() -> FirmwareConfig {
        FirmwareConfig {
            handshake_delay_ms: 0,
            ..FirmwareConfig::default()
        }
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::new((0..len).map(|i| i as u8).collect()).unwrap()
    }

    #[test]
    fn image_checksum_is_checked() {
        let data = b"123456789".to_vec();
        assert_eq!(FirmwareImage::new(data.clone()).unwrap().checksum(), 0xCBF4_3926);
        assert!(matches!(
            FirmwareImage::with_checksum(data, 1),
            Err(FirmwareError::ImageChecksum { expected: 1, .. })
        ));
        assert!(matches!(FirmwareImage::new(Vec::new()), Err(FirmwareError::EmptyImage)));
    }

    #[test]
    fn update_writes_verifies_and_reboots() {
        let (mock, mut updater) = updater(config());
        let image = image(100);

        updater.update(&image).unwrap();

        let s = mock.state();
        assert_eq!(s.image, image.data());
        assert_eq!(s.reboots, 1);
        assert_eq!(s.opcodes(), vec![0x80, 0x81, 0x82, 0x82, 0x82, 0x82, 0x83, 0x84]);
        assert_eq!(updater.state(), UpdateState::Idle);
    }

    #[test]
    fn chunks_are_limited_by_packet_size() {
        let (mock, mut updater) = updater(FirmwareConfig {
            chunk_size: 255,
            ..config()
        });
        mock.state().bootloader_chunk_size = 200;

        updater.update(&image(100)).unwrap();

        let lengths: Vec<usize> = mock
            .state()
            .frames
            .iter()
            .filter(|f| f[0] == 0x82)
            .map(|f| f.len())
            .collect();
        assert_eq!(lengths, vec![64, 48]);
    }

    #[test]
    fn checksum_mismatch_never_reboots() {
        let (mock, mut updater) = updater(config());
        mock.state().checksum_override = Some(0xDEAD_BEEF);

        let err = updater.update(&image(64)).unwrap_err();
        assert_eq!(err.stage, UpdateState::Verifying);
        assert!(matches!(err.source, FirmwareError::ChecksumMismatch { actual: 0xDEAD_BEEF, .. }));
        assert_eq!(mock.state().reboots, 0);
        assert_eq!(updater.state(), UpdateState::Failed);
    }

    #[test]
    fn interrupted_transfer_fails_without_reboot() {
        let (mock, mut updater) = updater(config());
        // Ten chunks of 32 bytes, the fourth write fails.
        mock.state().fail_at = Some((0x82, 3));

        let err = updater.update(&image(320)).unwrap_err();
        assert_eq!(err.stage, UpdateState::Transferring);
        assert!(matches!(err.source, FirmwareError::Probe(_)));

        let s = mock.state();
        assert_eq!(s.count(0x82), 4);
        assert_eq!(s.image.len(), 96);
        assert_eq!(s.count(0x84), 0);
        assert_eq!(s.count(0x83), 0);
    }

    #[test]
    fn handshake_is_retried() {
        let (mock, mut updater) = updater(config());
        mock.state().fail_at = Some((0x81, 0));
        updater.update(&image(10)).unwrap();
        assert_eq!(mock.state().count(0x81), 2);
    }

    #[test]
    fn handshake_gives_up() {
        let (mock, mut updater) = updater(FirmwareConfig {
            handshake_attempts: 1,
            ..config()
        });
        mock.state().fail_at = Some((0x81, 0));

        let err = updater.update(&image(10)).unwrap_err();
        assert_eq!(err.stage, UpdateState::BootloaderHandshake);
        assert!(matches!(err.source, FirmwareError::HandshakeFailed { attempts: 1 }));
        assert_eq!(mock.state().count(0x82), 0);
    }

    #[test]
    fn oversized_image_is_refused() {
        let (mock, mut updater) = updater(config());
        let err = updater.update(&image(0x1_0001)).unwrap_err();
        assert!(matches!(err.source, FirmwareError::ImageTooLarge { max: 0x1_0000, .. }));
        assert_eq!(mock.state().count(0x82), 0);
    }
}
