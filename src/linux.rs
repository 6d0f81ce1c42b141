use std::cell::RefCell;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Bootloader, Options, Port, PortError};

/// Serial port shared between the reader and writer slots
pub type LinuxPort = Rc<RefCell<Port<Serial, Delay>>>;

pub type LinuxBootloader = Bootloader<LinuxPort, LinuxPort, PortError<IoErrorKind>>;

impl Bootloader<LinuxPort, LinuxPort, PortError<IoErrorKind>> {
    /// Create a new linux serial port bootloader client.
    ///
    /// Opens and configures the port (8E1, no flow control) and pulses
    /// DTR/RTS to reset the device unless `options.no_reset` is set. The
    /// caller still needs to [`sync`](Bootloader::sync) before issuing
    /// commands.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Reads return immediately, the port adapter owns the poll timing
        port.0.set_timeout(Duration::from_millis(0))?;

        let mut delay = Delay {};

        if !options.no_reset {
            reset(&mut port, &mut delay, &options)?;
        }

        let shared = Rc::new(RefCell::new(Port::new(port, delay, options)));

        // Return instance
        Ok(Self::with_transport(shared.clone(), shared))
    }
}

/// Pulse DTR and RTS to reset the target into its bootloader
pub fn reset(port: &mut Serial, delay: &mut Delay, options: &Options) -> Result<(), SerialError> {
    debug!("Resetting device");

    port.0.set_dtr(true)?;
    port.0.set_rts(true)?;

    delay.delay_ms(100u32);

    port.0.set_dtr(false)?;
    port.0.set_rts(false)?;

    delay.delay_ms(options.init_delay_ms);

    Ok(())
}
