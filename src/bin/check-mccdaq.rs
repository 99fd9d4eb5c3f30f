//! Checks communication with a DAQFlex device: reads a few blocks with one
//! and with four channels enabled and verifies the shape of the data.

use clap::{Arg, Command, value_parser};
use mccdaq::{ChannelRange, Config, DeviceModel, MccDaq};
use std::{error::Error, path::PathBuf};

const SAMPLE_RATE: u32 = 2048;
const SAMPLES_PER_READ: usize = 1024;
const READS: usize = 4;

fn check_channels(daq: &mut MccDaq, low: u8, high: u8) -> Result<(), Box<dyn Error>> {
    daq.set_channel_range(low, high)?;
    let expected = (usize::from(high - low) + 1, SAMPLES_PER_READ);

    daq.start()?;
    for i in 0..READS {
        let data = daq.read()?;
        if data.dim() != expected {
            daq.stop();
            return Err(format!("read {i}: got shape {:?}, expected {:?}", data.dim(), expected).into());
        }
    }
    daq.stop();

    eprintln!("channels {low}..={high}: {READS} reads of {expected:?} ok");
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = Command::new("check-mccdaq")
        .about("Check data acquisition from a Measurement Computing DAQ")
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .default_value("USB_1608G")
                .value_parser(value_parser!(DeviceModel))
                .help("Type of device to test"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .value_parser(value_parser!(String))
                .help("Serial number of the device"),
        )
        .arg(
            Arg::new("firmware")
                .long("firmware")
                .value_parser(value_parser!(PathBuf))
                .default_value("fw")
                .help("Directory with FPGA images"),
        )
        .get_matches();

    let config = Config {
        channel_range: ChannelRange::new(0, 0)?,
        device: *matches.get_one::<DeviceModel>("device").unwrap(),
        serial_number: matches.get_one::<String>("serial").cloned(),
        firmware_dir: matches.get_one::<PathBuf>("firmware").unwrap().clone(),
        ..Config::new(SAMPLE_RATE, SAMPLES_PER_READ)
    };

    let mut daq = MccDaq::open(config)?;
    check_channels(&mut daq, 0, 0)?;
    check_channels(&mut daq, 0, 3)?;

    eprintln!("Done!");
    Ok(())
}
