//! Measurement Computing USB DAQ devices over the DAQFlex protocol.
//!
//! ```no_run
//! use mccdaq::{ChannelRange, Config, MccDaq};
//!
//! let config = Config {
//!     channel_range: ChannelRange::new(0, 3)?,
//!     ..Config::new(2048, 1024)
//! };
//! let mut daq = MccDaq::open(config)?;
//! daq.start()?;
//! let data = daq.read()?;
//! assert_eq!(data.dim(), (4, 1024));
//! daq.stop();
//! # Ok::<(), mccdaq::mccdaq::Error>(())
//! ```

pub mod daqflex;
pub mod fpga;
pub mod mccdaq;

pub use daqflex::{Calibration, DaqFlex, DeviceModel, McDevice};
pub use mccdaq::{ChannelRange, Config, InputRange, MccDaq};
