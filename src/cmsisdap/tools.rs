//! Finding and opening CMSIS-DAP probes over USB bulk (v2) or HID (v1).
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hidapi::HidApi;
use nusb::transfer::{Direction, EndpointType};
use nusb::DeviceInfo;

use super::commands::CmsisDapDevice;
use super::CmsisDap;

const USB_CLASS_HID: u8 = 0x03;

/// Probes that do not say "CMSIS-DAP" in their strings.
const KNOWN_PROBES: &[(u16, u16)] = &[
    // NXP LPC-Link2 with CMSIS-DAP firmware
    (0x1fc9, 0x0090),
    // NXP MCU-Link
    (0x1fc9, 0x0143),
    // WCH-Link in DAP mode, shares its strings with the RISC-V mode
    (0x1a86, 0x8012),
];

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no CMSIS-DAP probe found")]
    NoProbes,
    #[error("{0} probes found, select one with VID:PID[:SERIAL]")]
    Ambiguous(usize),
    #[error("no CMSIS-DAP probe matches {0}")]
    NotFound(ProbeSelector),
    #[error("'{0}' is not a probe selector, expected VID:PID[:SERIAL] in hex")]
    InvalidSelector(String),
    #[error(transparent)]
    Hid(#[from] hidapi::HidError),
}

/// A probe found while scanning the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeListing {
    pub product: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    /// HID interface for composite devices; `None` means the first one.
    pub hid_interface: Option<u8>,
}

impl fmt::Display for ProbeListing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -- {}", self.product, ProbeSelector::from(self))
    }
}

/// `VID:PID[:SERIAL]`, the IDs in hex. The serial may contain colons.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProbeSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl ProbeSelector {
    fn matches(&self, vendor_id: u16, product_id: u16, serial_number: Option<&str>) -> bool {
        self.vendor_id == vendor_id
            && self.product_id == product_id
            && self
                .serial_number
                .as_deref()
                .map_or(true, |sn| serial_number == Some(sn))
    }
}

impl FromStr for ProbeSelector {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProbeError::InvalidSelector(s.to_owned());
        let mut parts = s.splitn(3, ':');
        let mut id = || {
            parts
                .next()
                .and_then(|part| u16::from_str_radix(part, 16).ok())
                .ok_or_else(invalid)
        };
        let vendor_id = id()?;
        let product_id = id()?;
        let serial_number = parts.next().filter(|sn| !sn.is_empty()).map(str::to_owned);

        Ok(Self {
            vendor_id,
            product_id,
            serial_number,
        })
    }
}

impl TryFrom<String> for ProbeSelector {
    type Error = ProbeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProbeSelector> for String {
    fn from(selector: ProbeSelector) -> Self {
        selector.to_string()
    }
}

impl From<&ProbeListing> for ProbeSelector {
    fn from(listing: &ProbeListing) -> Self {
        Self {
            vendor_id: listing.vendor_id,
            product_id: listing.product_id,
            serial_number: listing.serial_number.clone(),
        }
    }
}

impl fmt::Display for ProbeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(sn) = &self.serial_number {
            write!(f, ":{sn}")?;
        }
        Ok(())
    }
}

/// Devices spell it differently.
fn is_cmsis_dap(id: &str) -> bool {
    id.contains("CMSIS-DAP") || id.contains("CMSIS_DAP")
}

fn is_known_probe(vendor_id: u16, product_id: u16) -> bool {
    KNOWN_PROBES.contains(&(vendor_id, product_id))
}

/// All attached probes. USB descriptors are read with nusb, which may fail
/// for lack of permissions, so HID-only probes are added from hidapi.
#[tracing::instrument(skip_all)]
pub fn list_probes() -> Vec<ProbeListing> {
    let mut probes: Vec<ProbeListing> = match nusb::list_devices() {
        Ok(devices) => devices.filter_map(|device| usb_listing(&device)).collect(),
        Err(e) => {
            tracing::warn!("error listing devices with nusb: {:?}", e);
            Vec::new()
        }
    };
    tracing::debug!("Found {} CMSIS-DAP probes using nusb", probes.len());

    match HidApi::new() {
        Ok(api) => {
            for listing in api.device_list().filter_map(hid_listing) {
                let known = probes.iter().any(|p| {
                    ProbeSelector::from(p).matches(
                        listing.vendor_id,
                        listing.product_id,
                        listing.serial_number.as_deref(),
                    )
                });
                if !known {
                    tracing::trace!("Adding HID-only probe {:?}", listing);
                    probes.push(listing);
                }
            }
        }
        Err(e) => tracing::warn!("error listing HID devices: {}", e),
    }

    probes
}

fn usb_listing(device: &DeviceInfo) -> Option<ProbeListing> {
    let product = device.product_string().unwrap_or("");
    let mut found = is_cmsis_dap(product) || is_known_probe(device.vendor_id(), device.product_id());
    let mut hid_interface = None;

    for interface in device.interfaces() {
        if interface.interface_string().is_some_and(is_cmsis_dap) {
            found = true;
            if interface.class() == USB_CLASS_HID {
                hid_interface = Some(interface.interface_number());
            }
        }
    }

    found.then(|| ProbeListing {
        product: product.to_owned(),
        vendor_id: device.vendor_id(),
        product_id: device.product_id(),
        serial_number: device.serial_number().map(str::to_owned),
        hid_interface,
    })
}

fn hid_listing(device: &hidapi::DeviceInfo) -> Option<ProbeListing> {
    let product = device.product_string().unwrap_or("");
    let path = device.path().to_str().unwrap_or("");
    if !is_cmsis_dap(product) && !is_cmsis_dap(path) {
        return None;
    }
    Some(ProbeListing {
        product: product.to_owned(),
        vendor_id: device.vendor_id(),
        product_id: device.product_id(),
        serial_number: device.serial_number().map(str::to_owned),
        hid_interface: u8::try_from(device.interface_number()).ok(),
    })
}

/// Claim the CMSIS-DAP v2 bulk interface of `device_info`.
///
/// The v2 interface GUID is not used by every firmware (DAPLink among them),
/// so the interface is found by its string and a bulk OUT, bulk IN endpoint
/// pair, optionally followed by the SWO endpoint.
fn open_v2(device_info: &DeviceInfo) -> Option<CmsisDapDevice> {
    let device = device_info.open().ok()?;
    let configuration = device.configurations().next()?;

    for interface in configuration.interfaces() {
        let number = interface.interface_number();
        let named = device_info
            .interfaces()
            .find(|i| i.interface_number() == number)
            .and_then(|i| i.interface_string())
            .is_some_and(is_cmsis_dap);
        if !named {
            continue;
        }

        for alt in interface.alt_settings() {
            let eps: Vec<_> = alt.endpoints().collect();
            let [out_ep, in_ep, ..] = eps.as_slice() else {
                continue;
            };
            if eps.len() > 3
                || out_ep.transfer_type() != EndpointType::Bulk
                || out_ep.direction() != Direction::Out
                || in_ep.transfer_type() != EndpointType::Bulk
                || in_ep.direction() != Direction::In
            {
                continue;
            }

            match device.claim_interface(number) {
                Ok(handle) => {
                    tracing::debug!(
                        "Opening {:04x}:{:04x} in CMSIS-DAPv2 mode",
                        device_info.vendor_id(),
                        device_info.product_id()
                    );
                    return Some(CmsisDapDevice::V2 {
                        handle,
                        out_ep: out_ep.address(),
                        in_ep: in_ep.address(),
                        max_packet_size: in_ep.max_packet_size(),
                    });
                }
                Err(e) => tracing::debug!("Claiming interface {} failed: {}", number, e),
            }
        }
    }

    None
}

/// Open the probe matching `selector`, over v2 if possible, else over HID.
pub fn open_device(selector: &ProbeSelector) -> Result<CmsisDapDevice, ProbeError> {
    tracing::trace!("Attempting to open device matching {}", selector);

    // hidapi cannot tell interfaces apart by their strings, so the HID
    // interface number of composite devices comes from nusb.
    let mut hid_interface = None;
    if let Ok(devices) = nusb::list_devices() {
        for device in devices {
            if !selector.matches(device.vendor_id(), device.product_id(), device.serial_number()) {
                continue;
            }
            if let Some(listing) = usb_listing(&device) {
                hid_interface = listing.hid_interface;
                if let Some(device) = open_v2(&device) {
                    return Ok(device);
                }
            }
        }
    }

    tracing::debug!("Attempting to open {} in CMSIS-DAP v1 mode", selector);
    let api = HidApi::new()?;
    let info = api
        .device_list()
        .filter(|info| selector.matches(info.vendor_id(), info.product_id(), info.serial_number()))
        .find(|info| hid_interface.map_or(true, |n| info.interface_number() == n as i32))
        .ok_or_else(|| ProbeError::NotFound(selector.clone()))?;
    let handle = info.open_device(&api)?;

    let product = handle.get_product_string()?.unwrap_or_default();
    if !is_cmsis_dap(&product) && !is_known_probe(selector.vendor_id, selector.product_id) {
        return Err(ProbeError::NotFound(selector.clone()));
    }

    // 64 byte reports are the common case; the real size is asked for later.
    Ok(CmsisDapDevice::V1 {
        handle,
        report_size: 64,
    })
}

/// Open the probe `selector` names, or the only attached probe.
pub fn open_probe(selector: Option<&ProbeSelector>, timeout: Duration) -> Result<CmsisDap, ProbeError> {
    let selector = match selector {
        Some(selector) => selector.clone(),
        None => {
            let probes = list_probes();
            match probes.as_slice() {
                [] => return Err(ProbeError::NoProbes),
                [probe] => ProbeSelector::from(probe),
                _ => return Err(ProbeError::Ambiguous(probes.len())),
            }
        }
    };
    Ok(CmsisDap::from_device(open_device(&selector)?, timeout))
}
