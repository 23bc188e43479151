//! Opens a JBD BMS on a serial port using Tokio and the `tokio-serial` crate.
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::tokio_serial_async::JbdBms;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), jbdbms_lib::Error> {
//!     let mut bms = JbdBms::open("/dev/ttyUSB0", 9600)?;
//!     bms.set_timeout(Duration::from_millis(500));
//!     bms.set_delay(Duration::from_millis(100));
//!
//!     let status = bms.get_pack_status().await?;
//!     println!("Status: {status:?}");
//!
//!     let cells = bms.get_cell_voltages().await?;
//!     println!("Cell Voltages: {cells:?}");
//!     Ok(())
//! }
//! ```

use crate::correlator::Correlator;
use crate::Error;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// A correlator that owns a serial port.
pub type JbdBms = Correlator<SerialStream>;

impl Correlator<SerialStream> {
    /// Opens `port` 8N1 without flow control.
    ///
    /// # Arguments
    ///
    /// * `port`: The path to the serial port device (e.g., `/dev/ttyUSB0` on Linux, `COM3` on Windows).
    /// * `baud_rate`: Usually [`DEFAULT_BAUD_RATE`].
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, Error> {
        log::debug!("open {port} at {baud_rate} baud");
        let serial = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(Correlator::new(serial))
    }
}
