use mccdaq::daqflex::list_devices;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let devices = list_devices()?;
    if devices.is_empty() {
        eprintln!("No DAQFlex devices found");
    }
    for (model, serial) in devices {
        println!("{model}\t{}", serial.as_deref().unwrap_or("-"));
    }

    Ok(())
}
