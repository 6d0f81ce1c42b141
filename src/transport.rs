//! Transport capabilities consumed by the bootloader client.
//!
//! The protocol only needs two primitives: write every byte of a buffer, and
//! fill a buffer completely. Any timeout or cancellation policy belongs to the
//! implementor of [`RawRead`]; the client itself waits indefinitely while the
//! device reports busy.

use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::Options;

/// Transmit raw bytes, reporting failure if any byte was not sent
pub trait RawWrite<E> {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), E>;
}

/// Receive exactly `buff.len()` bytes or fail
pub trait RawRead<E> {
    fn read_raw(&mut self, buff: &mut [u8]) -> Result<(), E>;
}

impl<E, T: RawWrite<E> + ?Sized> RawWrite<E> for &mut T {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), E> {
        (**self).write_raw(data)
    }
}

impl<E, T: RawRead<E> + ?Sized> RawRead<E> for &mut T {
    fn read_raw(&mut self, buff: &mut [u8]) -> Result<(), E> {
        (**self).read_raw(buff)
    }
}

// Shared handles let a single port back both the reader and writer slots

impl<E, T: RawWrite<E>> RawWrite<E> for Rc<RefCell<T>> {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), E> {
        self.borrow_mut().write_raw(data)
    }
}

impl<E, T: RawRead<E>> RawRead<E> for Rc<RefCell<T>> {
    fn read_raw(&mut self, buff: &mut [u8]) -> Result<(), E> {
        self.borrow_mut().read_raw(buff)
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum PortError<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("timeout waiting for bootloader response")]
    ResponseTimeout,
}

/// Adapts a non-blocking embedded-hal serial port into raw read/write
/// capabilities, polling with `delay` and giving up on silent reads after
/// `Options::response_timeout_ms`.
pub struct Port<P, D> {
    port: P,
    delay: D,
    options: Options,
}

impl<P, D> Port<P, D> {
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self { port, delay, options }
    }

    /// Access the underlying serial port
    pub fn inner(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the serial port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }
}

impl<P, D, E> Port<P, D>
where
    P: Read<u8, Error = E>,
    D: DelayMs<u32>,
{
    fn read_byte(&mut self) -> Result<u8, PortError<E>> {
        let mut t: u32 = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(PortError::Serial(e)),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period, an empty poll counts as at least 1ms
            self.delay.delay_ms(self.options.poll_delay_ms);
            t = t.saturating_add(self.options.poll_delay_ms.max(1));

            if t > self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(PortError::ResponseTimeout);
            }
        }
    }
}

impl<P, D, E> RawWrite<PortError<E>> for Port<P, D>
where
    P: Write<u8, Error = E>,
{
    fn write_raw(&mut self, data: &[u8]) -> Result<(), PortError<E>> {
        for b in data {
            block!(self.port.write(*b)).map_err(PortError::Serial)?;
        }
        Ok(())
    }
}

impl<P, D, E> RawRead<PortError<E>> for Port<P, D>
where
    P: Read<u8, Error = E>,
    D: DelayMs<u32>,
{
    fn read_raw(&mut self, buff: &mut [u8]) -> Result<(), PortError<E>> {
        for b in buff.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }
}
