use clap::{Arg, Command, value_parser};
use mccdaq::{ChannelRange, Config, DeviceModel, InputRange, MccDaq};
use status_line::StatusLine;
use std::{
    error::Error,
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    process::exit,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let matches = Command::new("capture-csv")
        .about("Capture calibrated analog input data from a Measurement Computing DAQ")
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_parser(value_parser!(PathBuf))
                .default_value("capture.csv")
                .help("Output file"),
        )
        .arg(
            Arg::new("samplerate")
                .short('s')
                .long("samplerate")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("2048")
                .help("Sample rate in Hz"),
        )
        .arg(
            Arg::new("samples")
                .short('n')
                .long("samples-per-read")
                .value_parser(value_parser!(usize))
                .default_value("1024")
                .help("Samples per channel in each read"),
        )
        .arg(
            Arg::new("low")
                .long("low")
                .value_parser(value_parser!(u8))
                .default_value("0")
                .help("First channel"),
        )
        .arg(
            Arg::new("high")
                .long("high")
                .value_parser(value_parser!(u8))
                .default_value("0")
                .help("Last channel (inclusive)"),
        )
        .arg(
            Arg::new("range")
                .short('r')
                .long("range")
                .value_parser(["1", "2", "5", "10"])
                .default_value("1")
                .help("Input range in volts (bipolar)"),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_parser(value_parser!(DeviceModel))
                .default_value("USB_1608G")
                .help("Type of device"),
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

    let output = matches.get_one::<PathBuf>("output").unwrap();
    let rate = *matches.get_one::<u32>("samplerate").unwrap();
    let volts = matches.get_one::<String>("range").unwrap().parse::<u32>()?;
    let config = Config {
        channel_range: ChannelRange::new(
            *matches.get_one::<u8>("low").unwrap(),
            *matches.get_one::<u8>("high").unwrap(),
        )?,
        input_range: InputRange::from_volts(volts).ok_or("invalid input range")?,
        device: *matches.get_one::<DeviceModel>("device").unwrap(),
        serial_number: matches.get_one::<String>("serial").cloned(),
        firmware_dir: matches.get_one::<PathBuf>("firmware").unwrap().clone(),
        ..Config::new(rate, *matches.get_one::<usize>("samples").unwrap())
    };

    let mut daq = MccDaq::open(config)?;
    let (low, high) = (daq.channel_range().low(), daq.channel_range().high());
    eprintln!(
        "starting acquisition of channels {}..={} at {} Hz, {}",
        low,
        high,
        rate,
        daq.input_range()
    );

    #[derive(Clone)]
    struct Progress {
        recorded: Arc<AtomicU64>,
        sample_rate: f64,
    }
    impl Display for Progress {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let recorded = self.recorded.load(Ordering::Relaxed);
            write!(
                f,
                "Recorded: {} ({:.02}s)",
                recorded,
                recorded as f64 / self.sample_rate
            )
        }
    }

    let recorded = Arc::new(AtomicU64::new(0));
    let progress = Progress {
        recorded: recorded.clone(),
        sample_rate: rate as f64,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        if stop_clone.load(Ordering::Relaxed) {
            eprintln!("Killing...");
            exit(-1);
        }
        stop_clone.store(true, Ordering::Relaxed);
    })?;

    let mut out = BufWriter::new(File::create(output)?);
    writeln!(
        out,
        "# {} {} Hz {} captured {}",
        matches.get_one::<DeviceModel>("device").unwrap(),
        rate,
        daq.input_range(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    let header: Vec<String> = (low..=high).map(|ch| format!("ai{ch}")).collect();
    writeln!(out, "{}", header.join(","))?;

    let status = StatusLine::new(progress.clone());
    daq.start()?;
    while !stop.load(Ordering::Relaxed) {
        let data = match daq.read() {
            Ok(data) => data,
            Err(err) => {
                daq.stop();
                return Err(err.into());
            }
        };
        for sample in data.columns() {
            let line: Vec<String> = sample.iter().map(|v| format!("{v:.6}")).collect();
            writeln!(out, "{}", line.join(","))?;
        }
        recorded.fetch_add(data.ncols() as u64, Ordering::Relaxed);
    }
    daq.stop();
    out.flush()?;

    eprintln!("{}", progress);
    drop(status);
    eprintln!("Done!");

    Ok(())
}
