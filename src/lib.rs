//! STM32 ROM Bootloader client.
//!
//! Base on AN3155
//!
//! A [`Bootloader`] holds a raw writer and a raw reader and speaks the
//! command / acknowledgment protocol over them. Both are injected by the
//! caller, see [`transport`] for the capability traits and an adapter for
//! embedded-hal serial ports.

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

pub mod protocol;
pub use protocol::{Command, Erase, EraseMode, FrameError, Response, MAX_CHUNK};

pub mod transport;
pub use transport::{Port, PortError, RawRead, RawWrite};

#[cfg(feature = "linux")]
pub mod linux;

use protocol::{address_frame, command_frame, data_frame, read_len_frame, UART_DISC};

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<TransportError> {
    /// Writer slot is unset
    #[error("no writer bound")]
    NoWriter,

    /// Reader slot is unset
    #[error("no reader bound")]
    NoReader,

    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("transport error: {0:?}")]
    Transport(TransportError),

    #[error("bootloader nack")]
    Nack,

    #[error("unexpected response: 0x{0:02x}")]
    InvalidResponse(u8),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for each bootloader response byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            init_delay_ms: 10,
        }
    }
}

/// Bootloader version and supported commands, from [`Command::Get`]
#[derive(Clone, PartialEq, Debug)]
pub struct Info {
    pub version: u8,
    pub commands: Vec<u8>,
}

/// Bootloader version and option bytes, from [`Command::GetVersion`]
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Version {
    pub version: u8,
    pub option1: u8,
    pub option2: u8,
}

/// Client handle for one bootloader link.
///
/// Operations take `&mut self` so only one may be in flight per link.
pub struct Bootloader<W, R, E> {
    writer: Option<W>,
    reader: Option<R>,
    _err: PhantomData<E>,
}

impl<W, R, E> Bootloader<W, R, E>
where
    W: RawWrite<E>,
    R: RawRead<E>,
    E: Debug,
{
    /// Create a bootloader client with no transport bound
    pub fn new() -> Self {
        Self {
            writer: None,
            reader: None,
            _err: PhantomData,
        }
    }

    /// Create a bootloader client bound to the provided writer and reader
    pub fn with_transport(writer: W, reader: R) -> Self {
        Self {
            writer: Some(writer),
            reader: Some(reader),
            _err: PhantomData,
        }
    }

    pub fn set_writer(&mut self, writer: W) {
        self.writer = Some(writer);
    }

    pub fn set_reader(&mut self, reader: R) {
        self.reader = Some(reader);
    }

    /// Unbind and return the writer
    pub fn take_writer(&mut self) -> Option<W> {
        self.writer.take()
    }

    /// Unbind and return the reader
    pub fn take_reader(&mut self) -> Option<R> {
        self.reader.take()
    }

    /// Send the synchronisation character so the bootloader can detect the baud rate.
    ///
    /// A NACK is accepted, the bootloader is already synchronised and has
    /// rejected 0x7F as a command.
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        debug!("Sending discovery character");
        self.write(&[UART_DISC])?;

        debug!("Awaiting bootloader response");
        match self.wait_for_ack() {
            Err(Error::Nack) => {
                debug!("Bootloader already synchronised");
                Ok(())
            }
            r => r,
        }
    }

    /// Write a command frame and await its acknowledgment
    pub fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("Sending command {:?}", command);
        self.write(&command_frame(command))?;

        self.wait_for_ack()
    }

    /// Read acknowledgment bytes until the bootloader accepts or rejects the
    /// previous phase.
    ///
    /// BUSY responses are retried without bound, a deadline must come from
    /// the reader failing.
    pub fn wait_for_ack(&mut self) -> Result<(), Error<E>> {
        let mut v = [0u8; 1];

        loop {
            self.read(&mut v)?;

            match Response::from_byte(v[0]) {
                Some(Response::Ack) => {
                    trace!("Received bootloader ack");
                    return Ok(());
                }
                Some(Response::Busy) => {
                    trace!("Received bootloader busy");
                }
                Some(Response::Nack) => {
                    debug!("Received bootloader nack");
                    return Err(Error::Nack);
                }
                None => {
                    debug!("Received unexpected value: 0x{:02x}", v[0]);
                    return Err(Error::InvalidResponse(v[0]));
                }
            }
        }
    }

    /// Write up to [`MAX_CHUNK`] bytes to memory at `address`.
    ///
    /// Data is zero padded to a multiple of 4 bytes on the wire.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        // Validate and encode before touching the transport
        let frame = data_frame(data)?;

        self.send_command(Command::WriteMemory)?;
        self.send_address(address)?;

        debug!("Writing {} bytes at 0x{:08x}", data.len(), address);
        self.write(&frame)?;

        self.wait_for_ack()
    }

    /// Write an arbitrary length buffer as consecutive [`MAX_CHUNK`] sized
    /// memory writes, reporting the number of bytes written after each chunk
    pub fn write_bulk<F>(&mut self, address: u32, data: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize),
    {
        if data.is_empty() {
            return Err(FrameError::Empty.into());
        }

        let mut complete = 0;

        for chunk in data.chunks(MAX_CHUNK) {
            self.write_memory(address.wrapping_add(complete as u32), chunk)?;

            complete += chunk.len();
            progress(complete);
        }

        Ok(())
    }

    /// Read up to [`MAX_CHUNK`] bytes of memory at `address` into `buff`
    pub fn read_memory(&mut self, address: u32, buff: &mut [u8]) -> Result<(), Error<E>> {
        let len = read_len_frame(buff.len())?;

        self.send_command(Command::ReadMemory)?;
        self.send_address(address)?;

        self.write(&len)?;
        self.wait_for_ack()?;

        debug!("Reading {} bytes from 0x{:08x}", buff.len(), address);
        self.read(buff)
    }

    /// Jump to the application whose vector table is at `address`
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.send_command(Command::Go)?;
        self.send_address(address)
    }

    /// Run an erase sequence, awaiting the final acknowledgment
    pub fn erase<M: EraseMode + ?Sized>(&mut self, mode: &M) -> Result<(), Error<E>> {
        let frame = mode.encode()?;

        self.send_command(mode.command())?;

        debug!("Sending erase sequence");
        self.write(&frame)?;

        self.wait_for_ack()
    }

    /// Erase all flash using the standard erase command
    pub fn erase_chip(&mut self) -> Result<(), Error<E>> {
        self.erase(&Erase::Global)
    }

    /// Fetch bootloader version and supported commands
    pub fn get(&mut self) -> Result<Info, Error<E>> {
        self.send_command(Command::Get)?;

        let mut n = [0u8; 1];
        self.read(&mut n)?;

        // N counts the bytes following the version byte
        let mut data = vec![0u8; n[0] as usize + 1];
        self.read(&mut data)?;
        self.wait_for_ack()?;

        let commands = data.split_off(1);

        Ok(Info {
            version: data[0],
            commands,
        })
    }

    /// Fetch bootloader version and read protection option bytes
    pub fn get_version(&mut self) -> Result<Version, Error<E>> {
        self.send_command(Command::GetVersion)?;

        let mut data = [0u8; 3];
        self.read(&mut data)?;
        self.wait_for_ack()?;

        Ok(Version {
            version: data[0],
            option1: data[1],
            option2: data[2],
        })
    }

    /// Fetch the chip product ID
    pub fn get_id(&mut self) -> Result<u16, Error<E>> {
        self.send_command(Command::GetId)?;

        let mut n = [0u8; 1];
        self.read(&mut n)?;

        // STM32 parts always report a two byte PID
        if n[0] != 1 {
            debug!("Unexpected PID length: {}", n[0] as usize + 1);
            return Err(Error::InvalidResponse(n[0]));
        }

        let mut id = [0u8; 2];
        self.read(&mut id)?;
        self.wait_for_ack()?;

        Ok(u16::from_be_bytes(id))
    }

    fn send_address(&mut self, address: u32) -> Result<(), Error<E>> {
        self.write(&address_frame(address))?;
        self.wait_for_ack()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        let w = self.writer.as_mut().ok_or(Error::NoWriter)?;

        trace!("=> {:02x?}", data);
        w.write_raw(data).map_err(Error::Transport)
    }

    fn read(&mut self, buff: &mut [u8]) -> Result<(), Error<E>> {
        let r = self.reader.as_mut().ok_or(Error::NoReader)?;

        r.read_raw(buff).map_err(Error::Transport)?;
        trace!("<= {:02x?}", buff);

        Ok(())
    }
}

impl<W, R, E> Default for Bootloader<W, R, E>
where
    W: RawWrite<E>,
    R: RawRead<E>,
    E: Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
