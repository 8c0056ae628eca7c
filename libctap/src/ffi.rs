//! Byte-buffer interface for foreign callers.
//!
//! Devices are listed once with [`ctap_count_devices`] and addressed by their
//! index in that snapshot. [`ctap_send_bytes`] forwards one raw CTAP message
//! and copies the raw response into a caller-owned buffer.

use std::slice;
use std::sync::{Arc, Mutex, PoisonError};

use futures::executor::block_on;
use tracing::{debug, error, warn};

use crate::transport::{AuthenticatorDevice, AuthenticatorListing};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiStatus {
    Ok = 0,
    NotListed = -1,
    NoSuchDevice = -2,
    NullPointer = -3,
    BufferTooSmall = -4,
    TransportFailure = -5,
}

/// Listing sources and the device snapshot taken from them.
#[derive(Default)]
pub struct FfiDeviceTable {
    listings: Vec<Arc<dyn AuthenticatorListing>>,
    devices: Option<Vec<Arc<dyn AuthenticatorDevice>>>,
}

impl FfiDeviceTable {
    pub const fn new() -> Self {
        Self {
            listings: Vec::new(),
            devices: None,
        }
    }

    /// Replaces the listings. The previous snapshot is discarded.
    pub fn install_listings(&mut self, listings: Vec<Arc<dyn AuthenticatorListing>>) {
        self.listings = listings;
        self.devices = None;
    }

    pub fn count_devices(&mut self) -> Result<usize, FfiStatus> {
        let mut devices = vec![];
        for listing in &self.listings {
            match block_on(listing.list_devices()) {
                Ok(listed) => devices.extend(listed),
                Err(err) => {
                    error!(%err, "Device listing failed");
                    return Err(FfiStatus::TransportFailure);
                }
            }
        }
        debug!({ count = devices.len() }, "Device snapshot taken");
        let count = devices.len();
        self.devices = Some(devices);
        Ok(count)
    }

    pub fn device(&self, device_number: u32) -> Result<Arc<dyn AuthenticatorDevice>, FfiStatus> {
        let Some(devices) = &self.devices else {
            return Err(FfiStatus::NotListed);
        };
        devices
            .get(device_number as usize)
            .cloned()
            .ok_or(FfiStatus::NoSuchDevice)
    }

    /// Sends `input` and copies the response into `output`, returning its length.
    /// Nothing is written when the response does not fit.
    pub fn send(
        &self,
        device_number: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, FfiStatus> {
        let device = self.device(device_number)?;
        send_to(device.as_ref(), input, output)
    }
}

fn send_to(
    device: &dyn AuthenticatorDevice,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, FfiStatus> {
    let response = block_on(device.send(input)).map_err(|err| {
        error!(%err, %device, "Transport failure");
        FfiStatus::TransportFailure
    })?;
    let Some(target) = output.get_mut(..response.len()) else {
        warn!(
            { needed = response.len(), capacity = output.len() },
            "Output buffer too small"
        );
        return Err(FfiStatus::BufferTooSmall);
    };
    target.copy_from_slice(&response);
    Ok(response.len())
}

static TABLE: Mutex<FfiDeviceTable> = Mutex::new(FfiDeviceTable::new());

fn status(result: Result<i32, FfiStatus>) -> i32 {
    result.unwrap_or_else(|status| status as i32)
}

/// Sets the listings the extern functions enumerate.
pub fn install_listings(listings: Vec<Arc<dyn AuthenticatorListing>>) {
    TABLE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .install_listings(listings);
}

/// Lists devices and returns how many there are, or a negative status.
#[no_mangle]
pub extern "C" fn ctap_count_devices() -> i32 {
    let mut table = TABLE.lock().unwrap_or_else(PoisonError::into_inner);
    status(
        table
            .count_devices()
            .map(|count| i32::try_from(count).unwrap_or(i32::MAX)),
    )
}

/// Sends `input_len` bytes from `input` to device `device_number`.
///
/// On entry `*output_len` is the capacity of `output`; on success it is the
/// number of bytes written. On failure `*output_len` is left as it was.
///
/// # Safety
///
/// `input` must be valid for `input_len` bytes, `output` for `*output_len`
/// bytes, and `output_len` must point to a writable `u32`.
#[no_mangle]
pub unsafe extern "C" fn ctap_send_bytes(
    device_number: u32,
    input: *const u8,
    input_len: usize,
    output: *mut u8,
    output_len: *mut u32,
) -> i32 {
    if input.is_null() || output.is_null() || output_len.is_null() {
        error!("Null pointer passed to ctap_send_bytes");
        return FfiStatus::NullPointer as i32;
    }
    let input = slice::from_raw_parts(input, input_len);
    let output = slice::from_raw_parts_mut(output, *output_len as usize);

    let device = {
        let table = TABLE.lock().unwrap_or_else(PoisonError::into_inner);
        match table.device(device_number) {
            Ok(device) => device,
            Err(status) => return status as i32,
        }
    };
    // The table lock is not held while the device is busy.
    match send_to(device.as_ref(), input, output) {
        Ok(written) => {
            *output_len = written as u32;
            FfiStatus::Ok as i32
        }
        Err(status) => status as i32,
    }
}
