//! Scan session on top of a [`DaqFlex`] device: configuration, start/stop,
//! and conversion of raw scan data into normalized per channel samples.

use std::{fmt, ops::RangeInclusive, path::PathBuf};

use log::{debug, info, warn};
use ndarray::{Array2, ShapeError};

use crate::daqflex::{self, Calibration, DaqFlex, DeviceModel, McDevice};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("driver error: {0}")]
    Driver(daqflex::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid channel range {low}..={high}")]
    InvalidChannelRange { low: u8, high: u8 },

    #[error("short read: expected {expected} samples, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("cannot reshape scan data: {0}")]
    Shape(ShapeError),
}

/// Bipolar input voltage range of the analog inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputRange {
    #[default]
    Bip1V,
    Bip2V,
    Bip5V,
    Bip10V,
}

impl InputRange {
    pub fn volts(self) -> u32 {
        match self {
            InputRange::Bip1V => 1,
            InputRange::Bip2V => 2,
            InputRange::Bip5V => 5,
            InputRange::Bip10V => 10,
        }
    }

    pub fn from_volts(volts: u32) -> Option<InputRange> {
        match volts {
            1 => Some(InputRange::Bip1V),
            2 => Some(InputRange::Bip2V),
            5 => Some(InputRange::Bip5V),
            10 => Some(InputRange::Bip10V),
            _ => None,
        }
    }
}

impl fmt::Display for InputRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BIP{}V", self.volts())
    }
}

/// Inclusive range of analog input channels, `low <= high`.
///
/// ```compile_fail
/// let range = mccdaq::ChannelRange { low: 3, high: 2 };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    low: u8,
    high: u8,
}

impl ChannelRange {
    pub fn new(low: u8, high: u8) -> Result<ChannelRange, Error> {
        if low > high {
            return Err(Error::InvalidChannelRange { low, high });
        }
        Ok(ChannelRange { low, high })
    }

    pub fn low(&self) -> u8 {
        self.low
    }

    pub fn high(&self) -> u8 {
        self.high
    }

    pub fn num_channels(&self) -> usize {
        usize::from(self.high - self.low) + 1
    }

    pub fn channels(&self) -> RangeInclusive<u8> {
        self.low..=self.high
    }
}

impl Default for ChannelRange {
    fn default() -> Self {
        ChannelRange { low: 0, high: 1 }
    }
}

/// Raw samples fetched by one read. The byte count of the transfer has to
/// fit in a `usize` as well.
fn scan_length(samples_per_read: usize, num_channels: usize) -> Result<usize, Error> {
    samples_per_read
        .checked_mul(num_channels)
        .filter(|samples| samples.checked_mul(2).is_some())
        .ok_or(Error::InvalidConfig(
            "samples per read too large for the channel count",
        ))
}

/// Settings of a scan session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Samples per channel returned by each [`MccDaq::read`].
    pub samples_per_read: usize,
    pub channel_range: ChannelRange,
    pub input_range: InputRange,
    pub device: DeviceModel,
    /// Connect to this device instead of the first one found.
    pub serial_number: Option<String>,
    /// Directory holding FPGA images.
    pub firmware_dir: PathBuf,
}

impl Config {
    pub fn new(rate: u32, samples_per_read: usize) -> Config {
        Config {
            rate,
            samples_per_read,
            channel_range: ChannelRange::default(),
            input_range: InputRange::default(),
            device: DeviceModel::default(),
            serial_number: None,
            firmware_dir: PathBuf::from("fw"),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.rate == 0 {
            return Err(Error::InvalidConfig("sample rate must be greater than zero"));
        }
        if self.samples_per_read == 0 {
            return Err(Error::InvalidConfig(
                "samples per read must be greater than zero",
            ));
        }
        let range = ChannelRange::new(self.channel_range.low, self.channel_range.high)?;
        scan_length(self.samples_per_read, range.num_channels())?;
        Ok(())
    }
}

/// An analog input scan session owning its device.
///
/// The device is configured when the session is created. A scan is run with
/// [`start`](MccDaq::start), any number of [`read`](MccDaq::read) calls, and
/// [`stop`](MccDaq::stop).
pub struct MccDaq<D = McDevice> {
    device: D,
    rate: u32,
    samples_per_read: usize,
    input_range: InputRange,
    channel_range: ChannelRange,
    calibration_data: Vec<Calibration>,
    scanning: bool,
}

impl MccDaq<McDevice> {
    /// Open the USB device named in `config` and configure it.
    pub fn open(config: Config) -> Result<MccDaq<McDevice>, Error> {
        config.validate()?;
        let device = McDevice::open(
            config.device,
            config.serial_number.as_deref(),
            &config.firmware_dir,
        )
        .map_err(Error::Driver)?;
        MccDaq::with_device(device, config)
    }
}

impl<D: DaqFlex> MccDaq<D> {
    /// Configure an already opened device.
    pub fn with_device(device: D, config: Config) -> Result<MccDaq<D>, Error> {
        config.validate()?;
        let mut daq = MccDaq {
            device,
            rate: config.rate,
            samples_per_read: config.samples_per_read,
            input_range: config.input_range,
            channel_range: config.channel_range,
            calibration_data: Vec::new(),
            scanning: false,
        };
        daq.initialize()?;
        Ok(daq)
    }

    fn send(&mut self, message: &str) -> Result<String, Error> {
        self.device.send_message(message).map_err(Error::Driver)
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.send("AISCAN:XFRMODE=BLOCKIO")?;
        self.send("AISCAN:SAMPLES=0")?;
        self.send("AISCAN:BURSTMODE=ENABLE")?;
        self.send("AI:CHMODE=SE")?;

        self.send(&format!("AISCAN:RATE={}", self.rate))?;
        self.send(&format!("AISCAN:RANGE={}", self.input_range))?;

        let ChannelRange { low, high } = self.channel_range;
        self.set_channel_range(low, high)?;
        info!(
            "configured {} Hz, {}, channels {}..={}",
            self.rate, self.input_range, low, high
        );
        Ok(())
    }

    /// Select the channels to scan, both bounds inclusive.
    ///
    /// Calibration is queried for every channel first; if the device rejects
    /// any of them the previous range stays in effect.
    pub fn set_channel_range(&mut self, low: u8, high: u8) -> Result<(), Error> {
        let range = ChannelRange::new(low, high)?;
        scan_length(self.samples_per_read, range.num_channels())?;

        let calibration_data = range
            .channels()
            .map(|channel| self.device.get_calib_data(channel))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Driver)?;
        debug!("calibration for channels {low}..={high}: {calibration_data:?}");

        self.channel_range = range;
        self.calibration_data = calibration_data;

        self.send(&format!("AISCAN:LOWCHAN={low}"))?;
        self.send(&format!("AISCAN:HIGHCHAN={high}"))?;
        Ok(())
    }

    /// Start the scan.
    ///
    /// Call [`read`](MccDaq::read) as soon as possible afterwards to obtain
    /// the very first samples recorded.
    pub fn start(&mut self) -> Result<(), Error> {
        self.device.flush_input_data().map_err(Error::Driver)?;
        self.send("AISCAN:START")?;
        self.scanning = true;
        info!("scan started");
        Ok(())
    }

    /// Read the next `samples_per_read` samples of every channel.
    ///
    /// The result has shape `(num_channels, samples_per_read)`. Each channel
    /// is calibrated to volts within `±input_range` and then divided by
    /// `input_range`, so a correctly calibrated signal lies in `[-1, 1]`.
    /// Values are not clamped.
    pub fn read(&mut self) -> Result<Array2<f64>, Error> {
        if !self.scanning {
            debug!("read without a running scan");
        }
        let num_channels = self.num_channels();
        let expected = scan_length(self.samples_per_read, num_channels)?;

        let mut raw = self
            .device
            .read_scan_data(expected, self.rate)
            .map_err(Error::Driver)?;
        if raw.len() < expected {
            return Err(Error::ShortRead {
                expected,
                actual: raw.len(),
            });
        }
        if raw.len() > expected {
            debug!("discarding {} surplus samples", raw.len() - expected);
            raw.truncate(expected);
        }

        // scan data is interleaved: one row per sample point
        let mut data = Array2::from_shape_vec(
            (self.samples_per_read, num_channels),
            raw.into_iter().map(f64::from).collect(),
        )
        .map_err(Error::Shape)?
        .reversed_axes();

        let range = f64::from(self.input_range.volts());
        for (channel, calib) in data.outer_iter_mut().zip(&self.calibration_data) {
            self.device
                .scale_and_calibrate_data(channel, -range, range, *calib);
        }
        data /= range;

        Ok(data.as_standard_layout().into_owned())
    }

    /// Stop the scan. Failures are only logged; the device then has to be
    /// started again before reading.
    pub fn stop(&mut self) {
        match self.send("AISCAN:STOP") {
            Ok(_) => info!("scan stopped"),
            Err(err) => warn!("DAQ could not be stopped. Check connection. ({err})"),
        }
        self.scanning = false;
    }

    pub fn num_channels(&self) -> usize {
        self.calibration_data.len()
    }

    pub fn calibration_data(&self) -> &[Calibration] {
        &self.calibration_data
    }

    pub fn channel_range(&self) -> ChannelRange {
        self.channel_range
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn samples_per_read(&self) -> usize {
        self.samples_per_read
    }

    pub fn input_range(&self) -> InputRange {
        self.input_range
    }

    /// Whether a scan was started and not stopped since. This turns false
    /// after every [`stop`](MccDaq::stop), including one the device failed
    /// to acknowledge, so the hardware may still be scanning.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_range_counts_inclusive() {
        assert_eq!(ChannelRange::new(0, 0).unwrap().num_channels(), 1);
        assert_eq!(ChannelRange::new(0, 3).unwrap().num_channels(), 4);
        assert_eq!(ChannelRange::new(2, 7).unwrap().channels().count(), 6);
        assert!(matches!(
            ChannelRange::new(4, 1),
            Err(Error::InvalidChannelRange { low: 4, high: 1 })
        ));
    }

    #[test]
    fn channel_range_accessors() {
        let range = ChannelRange::new(2, 7).unwrap();
        assert_eq!((range.low(), range.high()), (2, 7));
        assert_eq!(ChannelRange::new(0, u8::MAX).unwrap().num_channels(), 256);
    }

    #[test]
    fn scan_length_rejects_overflow() {
        assert_eq!(scan_length(1024, 4).unwrap(), 4096);
        assert!(scan_length(usize::MAX / 2, 1).is_ok());
        assert!(matches!(
            scan_length(usize::MAX / 2, 4),
            Err(Error::InvalidConfig(_))
        ));
        assert!(scan_length(usize::MAX / 2 + 1, 1).is_err());

        let config = Config {
            channel_range: ChannelRange::new(0, 3).unwrap(),
            ..Config::new(2048, usize::MAX / 2)
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn input_range_messages() {
        assert_eq!(InputRange::default().to_string(), "BIP1V");
        assert_eq!(InputRange::Bip10V.to_string(), "BIP10V");
        for volts in [1, 2, 5, 10] {
            assert_eq!(InputRange::from_volts(volts).unwrap().volts(), volts);
        }
        assert_eq!(InputRange::from_volts(3), None);
    }

    #[test]
    fn config_validation() {
        assert!(Config::new(2048, 1024).validate().is_ok());
        assert!(matches!(
            Config::new(0, 1024).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::new(2048, 0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        let config = Config {
            channel_range: ChannelRange { low: 3, high: 2 },
            ..Config::new(2048, 1024)
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidChannelRange { .. })
        ));
    }

    #[test]
    fn config_defaults() {
        let config = Config::new(1000, 100);
        assert_eq!(config.channel_range, ChannelRange { low: 0, high: 1 });
        assert_eq!(config.input_range, InputRange::Bip1V);
        assert_eq!(config.device, DeviceModel::Usb1608G);
        assert_eq!(config.firmware_dir, PathBuf::from("fw"));
    }
}
