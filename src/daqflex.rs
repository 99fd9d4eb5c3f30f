//! DAQFlex message protocol for Measurement Computing USB devices.
//!
//! Every DAQFlex device is driven by ASCII messages exchanged over vendor
//! control request `0x80`; scan data arrives on the bulk IN endpoint as
//! little-endian 16 bit ADC counts.

use std::{
    fmt,
    future::Future,
    path::Path,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

use futures_lite::future::{self, block_on};
use log::{debug, info};
use ndarray::ArrayViewMut1;
use nusb::{
    Device, DeviceInfo,
    transfer::{
        Control, ControlType, Direction, EndpointType, Queue, Recipient, RequestBuffer,
        TransferError,
    },
};

use crate::fpga;

/// USB vendor id of Measurement Computing.
pub const VENDOR_ID: u16 = 0x09db;

const REQUEST_MESSAGE: u8 = 0x80;
const MAX_MESSAGE_LENGTH: usize = 64;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const FLUSH_TIMEOUT: Duration = Duration::from_millis(20);
/// Bulk transfers kept submitted while a scan is read.
const IN_FLIGHT: usize = 16;
/// Upper bound on the up front allocation of a scan read.
const MAX_PREALLOC: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no {0} device found")]
    DeviceNotFound(DeviceModel),

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("device has no bulk input endpoint")]
    NoBulkEndpoint,

    #[error("cannot read configuration descriptor: {0}")]
    Descriptor(String),

    #[error("message {0:?} is not ascii")]
    InvalidMessage(String),

    #[error("could not send message {0:?}")]
    ShortWrite(String),

    #[error("send of {message:?} failed, possibly wrong command?")]
    SendFailed {
        message: String,
        source: TransferError,
    },

    #[error("invalid response {0:?}")]
    InvalidResponse(String),

    #[error("io error: {0}")]
    IoError(std::io::Error),

    #[error("usb transfer error: {0}")]
    UsbTransferError(TransferError),

    #[error("fpga error: {0}")]
    Fpga(fpga::Error),
}

/// The supported DAQFlex devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceModel {
    Usb7202,
    Usb7204,
    Usb2001Tc,
    Usb1608FsPlus,
    #[default]
    Usb1608G,
    Usb1608GX,
    Usb1608GX2Ao,
    Usb201,
    Usb204,
}

impl DeviceModel {
    pub const ALL: [DeviceModel; 9] = [
        DeviceModel::Usb7202,
        DeviceModel::Usb7204,
        DeviceModel::Usb2001Tc,
        DeviceModel::Usb1608FsPlus,
        DeviceModel::Usb1608G,
        DeviceModel::Usb1608GX,
        DeviceModel::Usb1608GX2Ao,
        DeviceModel::Usb201,
        DeviceModel::Usb204,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceModel::Usb7202 => "USB_7202",
            DeviceModel::Usb7204 => "USB_7204",
            DeviceModel::Usb2001Tc => "USB_2001_TC",
            DeviceModel::Usb1608FsPlus => "USB_1608FS_Plus",
            DeviceModel::Usb1608G => "USB_1608G",
            DeviceModel::Usb1608GX => "USB_1608GX",
            DeviceModel::Usb1608GX2Ao => "USB_1608GX_2AO",
            DeviceModel::Usb201 => "USB_201",
            DeviceModel::Usb204 => "USB_204",
        }
    }

    pub fn product_id(self) -> u16 {
        match self {
            DeviceModel::Usb7202 => 0x00f2,
            DeviceModel::Usb7204 => 0x00f0,
            DeviceModel::Usb2001Tc => 0x00f9,
            DeviceModel::Usb1608FsPlus => 0x00ea,
            DeviceModel::Usb1608G => 0x0110,
            DeviceModel::Usb1608GX => 0x0111,
            DeviceModel::Usb1608GX2Ao => 0x0112,
            DeviceModel::Usb201 => 0x0113,
            DeviceModel::Usb204 => 0x0114,
        }
    }

    /// Full scale ADC count.
    pub fn max_counts(self) -> u32 {
        match self {
            DeviceModel::Usb7204 | DeviceModel::Usb201 | DeviceModel::Usb204 => 0x0fff,
            DeviceModel::Usb2001Tc => 1,
            _ => 0xffff,
        }
    }

    /// File name of the FPGA bitstream the device needs before it accepts
    /// scan commands.
    pub fn fpga_image(self) -> Option<&'static str> {
        match self {
            DeviceModel::Usb1608G | DeviceModel::Usb1608GX | DeviceModel::Usb1608GX2Ao => {
                Some("USB_1608G.rbf")
            }
            _ => None,
        }
    }

    pub fn from_product_id(product_id: u16) -> Option<DeviceModel> {
        DeviceModel::ALL
            .into_iter()
            .find(|model| model.product_id() == product_id)
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceModel::ALL
            .into_iter()
            .find(|model| model.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownDevice(s.to_string()))
    }
}

/// Per channel calibration, valid for the currently selected input range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub slope: f64,
    pub offset: f64,
}

impl Calibration {
    pub const IDENTITY: Calibration = Calibration {
        slope: 1.0,
        offset: 0.0,
    };

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.slope + self.offset
    }
}

/// Parse the value of a `NAME=VALUE` reply.
fn parse_value(reply: &str) -> Result<f64, Error> {
    reply
        .split_once('=')
        .and_then(|(_, value)| value.trim().parse().ok())
        .ok_or_else(|| Error::InvalidResponse(reply.to_string()))
}

/// Bulk read timeout for a scan running at `rate` Hz: the time to fill half
/// a packet plus some slack.
pub fn scan_timeout(packet_size: usize, rate: u32) -> Duration {
    let millis = packet_size as u64 * 1000 / 2 / u64::from(rate.max(1)) + 10;
    Duration::from_millis(millis)
}

/// Operations of a DAQFlex device.
pub trait DaqFlex {
    /// Send a command message and return the device response.
    fn send_message(&mut self, message: &str) -> Result<String, Error>;

    /// Read and discard everything pending on the bulk input.
    fn flush_input_data(&mut self) -> Result<(), Error>;

    /// Read up to `length` samples of an `AISCAN` running at `rate` Hz.
    /// Fewer samples are returned if the device stops delivering data.
    fn read_scan_data(&mut self, length: usize, rate: u32) -> Result<Vec<u16>, Error>;

    fn max_counts(&self) -> u32;

    /// Query slope and offset of an analog input channel.
    fn get_calib_data(&mut self, channel: u8) -> Result<Calibration, Error> {
        let slope = parse_value(&self.send_message(&format!("?AI{{{channel}}}:SLOPE"))?)?;
        let offset = parse_value(&self.send_message(&format!("?AI{{{channel}}}:OFFSET"))?)?;
        Ok(Calibration { slope, offset })
    }

    /// Convert raw counts to volts in place.
    fn scale_and_calibrate_data(
        &self,
        mut data: ArrayViewMut1<'_, f64>,
        min_voltage: f64,
        max_voltage: f64,
        calib: Calibration,
    ) {
        let full_scale = max_voltage - min_voltage;
        let max_counts = f64::from(self.max_counts());
        data.mapv_inplace(|raw| calib.apply(raw) / max_counts * full_scale + min_voltage);
    }
}

struct BulkIn {
    queue: Queue<RequestBuffer>,
    packet_size: usize,
}

/// Resolves once its deadline has passed.
struct Deadline {
    at: Instant,
    armed: bool,
}

impl Deadline {
    fn after(timeout: Duration) -> Deadline {
        Deadline {
            at: Instant::now() + timeout,
            armed: false,
        }
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let now = Instant::now();
        if now >= self.at {
            return Poll::Ready(());
        }
        if !self.armed {
            self.armed = true;
            let waker = cx.waker().clone();
            let remaining = self.at - now;
            thread::spawn(move || {
                thread::sleep(remaining);
                waker.wake();
            });
        }
        Poll::Pending
    }
}

/// Wait for `completion`, or give up with `None` after `timeout`.
fn with_timeout<T>(completion: impl Future<Output = T>, timeout: Duration) -> Option<T> {
    block_on(future::or(async { Some(completion.await) }, async {
        Deadline::after(timeout).await;
        None
    }))
}

impl BulkIn {
    /// Read one packet, `None` on timeout.
    fn read_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        while self.queue.pending() < IN_FLIGHT {
            self.queue.submit(RequestBuffer::new(self.packet_size));
        }

        match with_timeout(self.queue.next_complete(), timeout) {
            Some(completion) => {
                completion.status.map_err(Error::UsbTransferError)?;
                Ok(Some(completion.data))
            }
            None => {
                self.cancel();
                Ok(None)
            }
        }
    }

    fn cancel(&mut self) {
        self.queue.cancel_all();
        while self.queue.pending() > 0 {
            let completion = block_on(self.queue.next_complete());
            if completion.status.is_ok() && !completion.data.is_empty() {
                debug!("dropped {} bytes completed during cancel", completion.data.len());
            }
        }
    }
}

/// A DAQFlex device attached over USB.
pub struct McDevice {
    model: DeviceModel,
    device: Device,
    bulk_in: Option<BulkIn>,
}

fn find_device(model: DeviceModel, serial_number: Option<&str>) -> Option<DeviceInfo> {
    nusb::list_devices().ok()?.find(|dev| {
        dev.vendor_id() == VENDOR_ID
            && dev.product_id() == model.product_id()
            && serial_number.is_none_or(|serial| dev.serial_number() == Some(serial))
    })
}

/// Locate the bulk IN endpoint of the first interface.
fn bulk_in_endpoint(device: &Device) -> Result<Option<(u8, u8, usize)>, Error> {
    let config = device
        .active_configuration()
        .map_err(|e| Error::Descriptor(e.to_string()))?;

    for alt in config.interface_alt_settings() {
        if alt.alternate_setting() != 0 {
            continue;
        }
        let endpoint = alt.endpoints().find(|ep| {
            ep.direction() == Direction::In && ep.transfer_type() == EndpointType::Bulk
        });
        if let Some(ep) = endpoint {
            return Ok(Some((alt.interface_number(), ep.address(), ep.max_packet_size())));
        }
    }
    Ok(None)
}

/// Serial numbers of every attached device of `model`.
pub fn find_serial_numbers(model: DeviceModel) -> Result<Vec<String>, Error> {
    Ok(nusb::list_devices()
        .map_err(Error::IoError)?
        .filter(|dev| dev.vendor_id() == VENDOR_ID && dev.product_id() == model.product_id())
        .filter_map(|dev| dev.serial_number().map(str::to_owned))
        .collect())
}

/// Every attached DAQFlex device with its serial number.
pub fn list_devices() -> Result<Vec<(DeviceModel, Option<String>)>, Error> {
    Ok(nusb::list_devices()
        .map_err(Error::IoError)?
        .filter(|dev| dev.vendor_id() == VENDOR_ID)
        .filter_map(|dev| {
            let model = DeviceModel::from_product_id(dev.product_id())?;
            Some((model, dev.serial_number().map(str::to_owned)))
        })
        .collect())
}

impl McDevice {
    /// Connect to a device, the first one found unless `serial_number` is
    /// given. FPGA images are looked up in `firmware_dir`.
    pub fn open(
        model: DeviceModel,
        serial_number: Option<&str>,
        firmware_dir: &Path,
    ) -> Result<McDevice, Error> {
        let descriptor =
            find_device(model, serial_number).ok_or(Error::DeviceNotFound(model))?;
        info!(
            "Found {} {:04X}:{:04X} (serial {})",
            model,
            descriptor.vendor_id(),
            descriptor.product_id(),
            descriptor.serial_number().unwrap_or("unknown")
        );

        let device = descriptor.open().map_err(Error::IoError)?;
        device.set_configuration(1).map_err(Error::IoError)?;

        let bulk_in = match bulk_in_endpoint(&device)? {
            Some((interface_number, address, packet_size)) => {
                let interface = device
                    .claim_interface(interface_number)
                    .map_err(Error::IoError)?;
                debug!("bulk in endpoint {address:#04x}, {packet_size} byte packets");
                Some(BulkIn {
                    queue: interface.bulk_in_queue(address),
                    packet_size,
                })
            }
            None => None,
        };

        let mut device = McDevice {
            model,
            device,
            bulk_in,
        };
        if let Some(image) = model.fpga_image() {
            device.configure_fpga(&firmware_dir.join(image))?;
        }
        Ok(device)
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    fn configure_fpga(&mut self, image: &Path) -> Result<(), Error> {
        if self.send_message("?DEV:FPGACFG")? == "DEV:FPGACFG=CONFIGMODE" {
            info!("fpga not loaded yet");
            // unlock code for the firmware upload
            self.send_message("DEV:FPGACFG=0xAD")?;
            fpga::program_fpga(&self.device, image).map_err(Error::Fpga)?;
        }

        let status = self.send_message("?DEV:FPGACFG")?;
        if status != "DEV:FPGACFG=CONFIGURED" {
            return Err(Error::Fpga(fpga::Error::NotConfigured(status)));
        }
        Ok(())
    }

    fn message_control() -> Control {
        Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: REQUEST_MESSAGE,
            value: 0,
            index: 0,
        }
    }
}

impl DaqFlex for McDevice {
    fn send_message(&mut self, message: &str) -> Result<String, Error> {
        if !message.is_ascii() {
            return Err(Error::InvalidMessage(message.to_string()));
        }
        // Some devices (e.g. USB-1608G series) expect a null-terminated string
        let mut request = message.to_ascii_uppercase().into_bytes();
        request.push(0);

        debug!("> {message}");
        let bytes_written = self
            .device
            .control_out_blocking(Self::message_control(), &request, CONTROL_TIMEOUT)
            .map_err(|source| Error::SendFailed {
                message: message.to_string(),
                source,
            })?;
        if bytes_written != request.len() {
            return Err(Error::ShortWrite(message.to_string()));
        }

        let mut buffer = [0u8; MAX_MESSAGE_LENGTH];
        let bytes_read = self
            .device
            .control_in_blocking(Self::message_control(), &mut buffer, CONTROL_TIMEOUT)
            .map_err(Error::UsbTransferError)?;

        let reply = &buffer[..bytes_read];
        if !reply.is_ascii() {
            return Err(Error::InvalidResponse(
                String::from_utf8_lossy(reply).into_owned(),
            ));
        }
        let reply = String::from_utf8_lossy(reply)
            .trim_end_matches('\0')
            .to_string();
        debug!("< {reply}");
        Ok(reply)
    }

    fn flush_input_data(&mut self) -> Result<(), Error> {
        let Some(bulk_in) = self.bulk_in.as_mut() else {
            return Ok(());
        };
        let mut flushed = 0;
        loop {
            match bulk_in.read_packet(FLUSH_TIMEOUT) {
                Ok(Some(packet)) if !packet.is_empty() => flushed += packet.len(),
                Ok(_) => break,
                Err(err) => {
                    debug!("flush stopped: {err}");
                    break;
                }
            }
        }
        debug!("flushed {flushed} bytes");
        Ok(())
    }

    fn read_scan_data(&mut self, length: usize, rate: u32) -> Result<Vec<u16>, Error> {
        let bulk_in = self.bulk_in.as_mut().ok_or(Error::NoBulkEndpoint)?;
        let timeout = scan_timeout(bulk_in.packet_size, rate);

        let mut bytes = Vec::with_capacity(length.saturating_mul(2).min(MAX_PREALLOC));
        while bytes.len() / 2 < length {
            match bulk_in.read_packet(timeout)? {
                Some(packet) if !packet.is_empty() => bytes.extend_from_slice(&packet),
                _ => {
                    debug!("scan data timed out after {} bytes", bytes.len());
                    break;
                }
            }
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn max_counts(&self) -> u32 {
        self.model.max_counts()
    }
}
