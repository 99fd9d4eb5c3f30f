use std::{
    collections::VecDeque,
    sync::{Mutex, Once},
    thread::{self, ThreadId},
};

use log::{Level, LevelFilter, Log, Metadata, Record};

use mccdaq::{
    Calibration, ChannelRange, Config, DaqFlex, InputRange, MccDaq,
    daqflex::{self, Error},
    mccdaq::Error as SessionError,
};
use proptest::prelude::*;

const CHANNELS: u8 = 8;

/// In-memory DAQFlex device answering calibration queries for channels
/// `0..CHANNELS` and producing scan data from a fixed pattern.
struct ScriptedDevice {
    sent: Vec<String>,
    max_counts: u32,
    calibration: Calibration,
    flushes: usize,
    fail_stop: bool,
    /// Overrides for the next scan reads.
    reads: VecDeque<Vec<u16>>,
    pattern: fn(usize) -> u16,
}

impl ScriptedDevice {
    fn new() -> ScriptedDevice {
        ScriptedDevice {
            sent: Vec::new(),
            max_counts: 0xffff,
            calibration: Calibration::IDENTITY,
            flushes: 0,
            fail_stop: false,
            reads: VecDeque::new(),
            pattern: |i| (i * 97 % 0x10000) as u16,
        }
    }

    fn channel_of(message: &str) -> Option<u8> {
        let start = message.find('{')? + 1;
        let end = message.find('}')?;
        message[start..end].parse().ok()
    }
}

impl DaqFlex for ScriptedDevice {
    fn send_message(&mut self, message: &str) -> Result<String, Error> {
        self.sent.push(message.to_string());
        if message == "AISCAN:STOP" && self.fail_stop {
            return Err(Error::ShortWrite(message.to_string()));
        }
        let reply = match message.strip_prefix('?') {
            Some(query) => match Self::channel_of(query) {
                Some(channel) if channel < CHANNELS => {
                    let value = if query.ends_with("SLOPE") {
                        self.calibration.slope
                    } else {
                        self.calibration.offset
                    };
                    format!("{query}={value}")
                }
                _ => return Err(Error::InvalidResponse(query.to_string())),
            },
            None => message.to_string(),
        };
        Ok(reply)
    }

    fn flush_input_data(&mut self) -> Result<(), Error> {
        self.flushes += 1;
        Ok(())
    }

    fn read_scan_data(&mut self, length: usize, _rate: u32) -> Result<Vec<u16>, Error> {
        Ok(self
            .reads
            .pop_front()
            .unwrap_or_else(|| (0..length).map(self.pattern).collect()))
    }

    fn max_counts(&self) -> u32 {
        self.max_counts
    }
}

/// Logger keeping every record together with the thread that emitted it.
struct CapturedLogs(Mutex<Vec<(ThreadId, Level, String)>>);

impl Log for CapturedLogs {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.0.lock().unwrap().push((
            thread::current().id(),
            record.level(),
            record.args().to_string(),
        ));
    }

    fn flush(&self) {}
}

static LOGS: CapturedLogs = CapturedLogs(Mutex::new(Vec::new()));

/// Records emitted so far by the calling test's thread.
fn logs_of_this_thread() -> Vec<(Level, String)> {
    let id = thread::current().id();
    LOGS.0
        .lock()
        .unwrap()
        .iter()
        .filter(|(thread, _, _)| *thread == id)
        .map(|(_, level, message)| (*level, message.clone()))
        .collect()
}

fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&LOGS).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
}

fn config(low: u8, high: u8, samples_per_read: usize) -> Config {
    Config {
        channel_range: ChannelRange::new(low, high).unwrap(),
        ..Config::new(2048, samples_per_read)
    }
}

#[test]
fn setup_messages_in_order() {
    let config = Config {
        input_range: InputRange::Bip5V,
        ..config(1, 2, 16)
    };
    let daq = MccDaq::with_device(ScriptedDevice::new(), config).unwrap();

    assert_eq!(
        daq.device().sent,
        [
            "AISCAN:XFRMODE=BLOCKIO",
            "AISCAN:SAMPLES=0",
            "AISCAN:BURSTMODE=ENABLE",
            "AI:CHMODE=SE",
            "AISCAN:RATE=2048",
            "AISCAN:RANGE=BIP5V",
            "?AI{1}:SLOPE",
            "?AI{1}:OFFSET",
            "?AI{2}:SLOPE",
            "?AI{2}:OFFSET",
            "AISCAN:LOWCHAN=1",
            "AISCAN:HIGHCHAN=2",
        ]
    );
    assert_eq!(daq.num_channels(), 2);
    assert!(!daq.is_scanning());
}

#[test]
fn channel_range_replaces_calibration() {
    let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(0, 1, 16)).unwrap();
    assert_eq!(daq.calibration_data().len(), 2);

    daq.set_channel_range(0, 3).unwrap();
    assert_eq!(daq.num_channels(), 4);
    assert_eq!(daq.calibration_data(), [Calibration::IDENTITY; 4]);
    assert_eq!(daq.channel_range(), ChannelRange::new(0, 3).unwrap());

    let sent = &daq.device().sent;
    assert_eq!(sent[sent.len() - 2..], ["AISCAN:LOWCHAN=0", "AISCAN:HIGHCHAN=3"]);
}

#[test]
fn rejected_channel_range_keeps_previous() {
    let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(0, 1, 16)).unwrap();

    let err = daq.set_channel_range(6, 9).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Driver(daqflex::Error::InvalidResponse(_))
    ));
    assert_eq!(daq.channel_range(), ChannelRange::new(0, 1).unwrap());
    assert_eq!(daq.num_channels(), 2);

    assert!(matches!(
        daq.set_channel_range(3, 2),
        Err(SessionError::InvalidChannelRange { low: 3, high: 2 })
    ));
    assert!(!daq.device().sent.iter().any(|m| m.contains("LOWCHAN=6")));
}

#[test]
fn construction_fails_on_invalid_channels() {
    let result = MccDaq::with_device(ScriptedDevice::new(), config(0, CHANNELS, 16));
    assert!(matches!(result, Err(SessionError::Driver(_))));

    let result = MccDaq::with_device(ScriptedDevice::new(), Config::new(0, 16));
    assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
}

#[test]
fn start_flushes_then_starts() {
    let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(0, 0, 16)).unwrap();
    daq.start().unwrap();

    assert_eq!(daq.device().flushes, 1);
    assert_eq!(daq.device().sent.last().unwrap(), "AISCAN:START");
    assert!(daq.is_scanning());

    daq.stop();
    assert_eq!(daq.device().sent.last().unwrap(), "AISCAN:STOP");
    assert!(!daq.is_scanning());
}

#[test]
fn single_channel_reads() {
    let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(0, 0, 1024)).unwrap();
    daq.start().unwrap();
    for _ in 0..4 {
        assert_eq!(daq.read().unwrap().dim(), (1, 1024));
    }
    daq.stop();
}

#[test]
fn multi_channel_reads() {
    let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(0, 0, 1024)).unwrap();
    daq.set_channel_range(0, 3).unwrap();
    daq.start().unwrap();
    for _ in 0..4 {
        assert_eq!(daq.read().unwrap().dim(), (4, 1024));
    }
    daq.stop();
}

#[test]
fn read_deinterleaves_channels() {
    let mut device = ScriptedDevice::new();
    // three samples of channel 0 at zero, channel 1 at full scale
    device.reads.push_back(vec![0, 0xffff, 0, 0xffff, 0, 0xffff]);
    let mut daq = MccDaq::with_device(device, config(0, 1, 3)).unwrap();

    daq.start().unwrap();
    let data = daq.read().unwrap();
    assert_eq!(data.dim(), (2, 3));
    assert!(data.row(0).iter().all(|&v| v == -1.0));
    assert!(data.row(1).iter().all(|&v| v == 1.0));
    assert!(data.is_standard_layout());
}

#[test]
fn read_applies_calibration_and_normalizes() {
    let mut device = ScriptedDevice::new();
    device.max_counts = 0x0fff;
    device.calibration = Calibration {
        slope: 2.0,
        offset: 5.0,
    };
    device.reads.push_back(vec![1000, 2000]);
    let config = Config {
        input_range: InputRange::Bip10V,
        ..config(0, 1, 1)
    };
    let mut daq = MccDaq::with_device(device, config).unwrap();

    let data = daq.read().unwrap();
    let volts = |raw: f64| ((raw * 2.0 + 5.0) / 4095.0 * 20.0 - 10.0) / 10.0;
    assert!((data[[0, 0]] - volts(1000.0)).abs() < 1e-12);
    assert!((data[[1, 0]] - volts(2000.0)).abs() < 1e-12);
}

#[test]
fn short_read_is_an_error() {
    let mut device = ScriptedDevice::new();
    device.reads.push_back(vec![0; 10]);
    let mut daq = MccDaq::with_device(device, config(0, 3, 4)).unwrap();

    assert!(matches!(
        daq.read(),
        Err(SessionError::ShortRead {
            expected: 16,
            actual: 10
        })
    ));
}

#[test]
fn surplus_samples_are_discarded() {
    let mut device = ScriptedDevice::new();
    device.reads.push_back(vec![0; 40]);
    let mut daq = MccDaq::with_device(device, config(0, 1, 8)).unwrap();

    assert_eq!(daq.read().unwrap().dim(), (2, 8));
}

#[test]
fn failed_stop_is_not_an_error() {
    capture_logs();
    let mut device = ScriptedDevice::new();
    device.fail_stop = true;
    let mut daq = MccDaq::with_device(device, config(0, 0, 16)).unwrap();

    daq.start().unwrap();
    daq.stop();
    assert_eq!(daq.device().sent.last().unwrap(), "AISCAN:STOP");
    assert!(!daq.is_scanning());

    let warnings: Vec<String> = logs_of_this_thread()
        .into_iter()
        .filter(|(level, _)| *level == Level::Warn)
        .map(|(_, message)| message)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("could not be stopped"));
    assert!(warnings[0].contains("AISCAN:STOP"));

    // the device has to be started again
    daq.start().unwrap();
    assert_eq!(daq.device().flushes, 2);
}

#[test]
fn successful_stop_does_not_warn() {
    capture_logs();
    let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(0, 0, 16)).unwrap();
    daq.start().unwrap();
    daq.stop();

    assert!(
        !logs_of_this_thread()
            .iter()
            .any(|(level, _)| *level == Level::Warn)
    );
}

#[test]
fn oversized_reads_are_rejected() {
    let result = MccDaq::with_device(ScriptedDevice::new(), config(0, 3, usize::MAX / 2));
    assert!(matches!(result, Err(SessionError::InvalidConfig(_))));

    // fits one channel, overflows once the range widens
    let mut daq =
        MccDaq::with_device(ScriptedDevice::new(), config(0, 0, usize::MAX / 2)).unwrap();
    let sent = daq.device().sent.len();
    assert!(matches!(
        daq.set_channel_range(0, 3),
        Err(SessionError::InvalidConfig(_))
    ));
    assert_eq!(daq.channel_range(), ChannelRange::new(0, 0).unwrap());
    assert_eq!(daq.num_channels(), 1);
    assert_eq!(daq.device().sent.len(), sent);
}

proptest! {
    #[test]
    fn read_shape_and_range(low in 0u8..CHANNELS, span in 0u8..CHANNELS, samples in 1usize..256) {
        let high = (low + span).min(CHANNELS - 1);
        let mut daq = MccDaq::with_device(ScriptedDevice::new(), config(low, high, samples)).unwrap();
        prop_assert_eq!(daq.calibration_data().len(), usize::from(high - low) + 1);

        daq.start().unwrap();
        let data = daq.read().unwrap();
        prop_assert_eq!(data.dim(), (daq.num_channels(), samples));
        prop_assert!(data.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
