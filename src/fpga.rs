//! Upload of the FPGA bitstream required by the USB-1608G family.
//!
//! The handshake around the upload (`?DEV:FPGACFG`, unlock code) is a DAQFlex
//! message exchange and lives in [`crate::daqflex`]; this module only moves
//! the raw image over the vendor control endpoint.

use log::{debug, info};
use nusb::{
    Device,
    transfer::{Control, ControlType, Recipient},
};
use std::{fs, io, path::Path, thread, time::Duration};

/// Vendor request that accepts one chunk of the bitstream.
const REQUEST_FPGA_DATA: u8 = 0x51;

/// The firmware expects the image in chunks of this size.
const CHUNK_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(io::Error),

    #[error("fpga image is empty")]
    EmptyImage,

    #[error("short write at offset {offset}: {written} of {expected} bytes")]
    ShortWrite {
        offset: usize,
        written: usize,
        expected: usize,
    },

    #[error("fpga not configured, device reports {0:?}")]
    NotConfigured(String),

    #[error("usb control transfer error: {0}")]
    UsbTransferError(nusb::transfer::TransferError),
}

fn write_chunk(device: &Device, offset: usize, data: &[u8]) -> Result<(), Error> {
    let bytes_written = device
        .control_out_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: REQUEST_FPGA_DATA,
                value: 0,
                index: 0,
            },
            data,
            Duration::from_secs(1),
        )
        .map_err(Error::UsbTransferError)?;

    if bytes_written != data.len() {
        return Err(Error::ShortWrite {
            offset,
            written: bytes_written,
            expected: data.len(),
        });
    }
    Ok(())
}

/// Stream an FPGA image to a device that has already been unlocked for
/// upload.
pub fn program_fpga(device: &Device, path: &Path) -> Result<(), Error> {
    // Bitstreams are a few hundred kilobytes, load the whole thing
    let image = fs::read(path).map_err(Error::IoError)?;
    if image.is_empty() {
        return Err(Error::EmptyImage);
    }

    info!("transferring {} ({} bytes) to the fpga", path.display(), image.len());
    for (i, chunk) in image.chunks(CHUNK_SIZE).enumerate() {
        write_chunk(device, i * CHUNK_SIZE, chunk)?;
    }
    debug!("fpga image sent");

    // The device ignores messages for a while after the last chunk
    thread::sleep(Duration::from_millis(250));

    Ok(())
}
