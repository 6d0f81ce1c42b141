//! Wire-level definitions and frame encoders for the AN3155 UART protocol.

/// Synchronisation character, lets the bootloader detect the baud rate
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;
pub const UART_BUSY: u8 = 0x76;

/// Maximum payload of a single read or write memory command
pub const MAX_CHUNK: usize = 256;

/// Maximum page count of a standard erase (N = 0xFF selects global erase)
pub const MAX_ERASE_PAGES: usize = 255;

/// Maximum page count of an extended erase (N >= 0xFFF0 selects special erases)
pub const MAX_EXTENDED_ERASE_PAGES: usize = 0xFFF0;

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,
}

/// Acknowledgment byte returned by the bootloader after each phase
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Response {
    Ack,
    Nack,
    /// Device is still working on the previous phase, poll again
    Busy,
}

impl Response {
    pub fn from_byte(v: u8) -> Option<Self> {
        match v {
            UART_ACK => Some(Response::Ack),
            UART_NACK => Some(Response::Nack),
            UART_BUSY => Some(Response::Busy),
            _ => None,
        }
    }
}

/// Frame validation failures, raised before any transport I/O
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("empty payload")]
    Empty,

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    TooLong { len: usize, max: usize },
}

/// XOR of every byte in `data`, zero for an empty slice
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |c, b| c ^ b)
}

/// Round a payload length up to the 4-byte flash write granularity
pub fn aligned_len(len: usize) -> usize {
    (len + 3) & !3
}

pub fn command_frame(command: Command) -> [u8; 2] {
    let c = command as u8;
    [c, c ^ 0xFF]
}

/// Big-endian address followed by its checksum
pub fn address_frame(address: u32) -> [u8; 5] {
    let mut frame = [0u8; 5];
    frame[..4].copy_from_slice(&address.to_be_bytes());
    frame[4] = checksum(&frame[..4]);
    frame
}

/// Build the data phase of a write memory command.
///
/// Layout is `[aligned_len - 1, data..., zero padding, checksum]` where the
/// checksum covers the length byte and the unpadded data only.
pub fn data_frame(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    check_len(data.len(), MAX_CHUNK)?;

    let aligned = aligned_len(data.len());
    let n = (aligned - 1) as u8;

    let mut frame = Vec::with_capacity(aligned + 2);
    frame.push(n);
    frame.extend_from_slice(data);
    frame.resize(aligned + 1, 0);
    frame.push(n ^ checksum(data));

    Ok(frame)
}

/// Build the length phase of a read memory command, `[N - 1, !(N - 1)]`
pub fn read_len_frame(len: usize) -> Result<[u8; 2], FrameError> {
    check_len(len, MAX_CHUNK)?;

    let n = (len - 1) as u8;
    Ok([n, n ^ 0xFF])
}

pub(crate) fn check_len(len: usize, max: usize) -> Result<(), FrameError> {
    match len {
        0 => Err(FrameError::Empty),
        l if l > max => Err(FrameError::TooLong { len, max }),
        _ => Ok(()),
    }
}

/// Device specific erase sub-protocol.
///
/// Supplies the command to issue and the bytes sent between the command
/// acknowledgment and the final acknowledgment.
pub trait EraseMode {
    fn command(&self) -> Command {
        Command::Erase
    }

    fn encode(&self) -> Result<Vec<u8>, FrameError>;
}

/// Erase sequences defined by AN3155
#[derive(Debug, PartialEq, Clone)]
pub enum Erase {
    /// Erase all flash using the standard erase command
    Global,
    /// Erase a list of pages using the standard erase command
    Pages(Vec<u8>),
    /// Mass erase using the extended erase command
    ExtendedGlobal,
    /// Erase a list of pages using the extended erase command
    ExtendedPages(Vec<u16>),
}

impl EraseMode for Erase {
    fn command(&self) -> Command {
        match self {
            Erase::Global | Erase::Pages(_) => Command::Erase,
            Erase::ExtendedGlobal | Erase::ExtendedPages(_) => Command::ExtendedErase,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut frame = match self {
            Erase::Global => return Ok(vec![0xFF, 0x00]),
            Erase::ExtendedGlobal => vec![0xFF, 0xFF],
            Erase::Pages(pages) => {
                check_len(pages.len(), MAX_ERASE_PAGES)?;

                let mut f = Vec::with_capacity(pages.len() + 2);
                f.push((pages.len() - 1) as u8);
                f.extend_from_slice(pages);
                f
            }
            Erase::ExtendedPages(pages) => {
                check_len(pages.len(), MAX_EXTENDED_ERASE_PAGES)?;

                let mut f = Vec::with_capacity(pages.len() * 2 + 3);
                f.extend_from_slice(&((pages.len() - 1) as u16).to_be_bytes());
                for p in pages {
                    f.extend_from_slice(&p.to_be_bytes());
                }
                f
            }
        };

        frame.push(checksum(&frame));
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_xor_of_bytes() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x5A]), 0x5A);
        assert_eq!(checksum(&[0xAA, 0xBB, 0xCC]), 0xAA ^ 0xBB ^ 0xCC);

        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(checksum(&data), data.iter().fold(0u8, |a, b| a ^ b));
    }

    #[test]
    fn aligned_len_rounds_up_to_words() {
        assert_eq!(aligned_len(1), 4);
        assert_eq!(aligned_len(3), 4);
        assert_eq!(aligned_len(4), 4);
        assert_eq!(aligned_len(5), 8);
        assert_eq!(aligned_len(255), 256);
        assert_eq!(aligned_len(256), 256);

        for len in 1..=MAX_CHUNK {
            assert_eq!(aligned_len(len), (len + 3) & !3);
            assert_eq!(aligned_len(len) % 4, 0);
        }
    }

    #[test]
    fn command_frame_carries_complement() {
        assert_eq!(command_frame(Command::WriteMemory), [0x31, 0xCE]);
        assert_eq!(command_frame(Command::Go), [0x21, 0xDE]);
        assert_eq!(command_frame(Command::Get), [0x00, 0xFF]);
        assert_eq!(command_frame(Command::Erase), [0x43, 0xBC]);
    }

    #[test]
    fn address_frame_is_big_endian_with_checksum() {
        assert_eq!(address_frame(0x0800_0000), [0x08, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(address_frame(0x1234_5678), [0x12, 0x34, 0x56, 0x78, 0x12 ^ 0x34 ^ 0x56 ^ 0x78]);

        for a in &[0u32, 0xFFFF_FFFF, 0x2000_0400, 0x0800_1F00] {
            let f = address_frame(*a);
            assert_eq!(f[4], f[0] ^ f[1] ^ f[2] ^ f[3]);
        }
    }

    #[test]
    fn data_frame_pads_and_checksums() {
        let frame = data_frame(&[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(frame, vec![0x03, 0xAA, 0xBB, 0xCC, 0x00, 0x03 ^ 0xAA ^ 0xBB ^ 0xCC]);
    }

    #[test]
    fn data_frame_size_tracks_alignment() {
        for len in 1..=MAX_CHUNK {
            let data = vec![0xA5; len];
            let frame = data_frame(&data).unwrap();
            let aligned = aligned_len(len);

            assert_eq!(frame.len(), aligned + 2);
            assert_eq!(frame[0] as usize, aligned - 1);
            assert!(frame[1 + len..=aligned].iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn data_frame_checksum_excludes_padding() {
        // Both payloads align to 4, non-zero padding would change the checksum
        let short = data_frame(&[0x10, 0x20]).unwrap();
        assert_eq!(short[5], 0x03 ^ 0x10 ^ 0x20);

        let full = data_frame(&[0xFF; 256]).unwrap();
        assert_eq!(full[0], 0xFF);
        assert_eq!(full[257], 0xFF ^ checksum(&[0xFF; 256]));
    }

    #[test]
    fn data_frame_rejects_bad_lengths() {
        assert_eq!(data_frame(&[]), Err(FrameError::Empty));
        assert_eq!(
            data_frame(&[0u8; 257]),
            Err(FrameError::TooLong { len: 257, max: 256 })
        );
    }

    #[test]
    fn read_len_frame_complements() {
        assert_eq!(read_len_frame(1), Ok([0x00, 0xFF]));
        assert_eq!(read_len_frame(256), Ok([0xFF, 0x00]));
        assert_eq!(read_len_frame(0), Err(FrameError::Empty));
    }

    #[test]
    fn response_decoding() {
        assert_eq!(Response::from_byte(0x79), Some(Response::Ack));
        assert_eq!(Response::from_byte(0x1F), Some(Response::Nack));
        assert_eq!(Response::from_byte(0x76), Some(Response::Busy));
        assert_eq!(Response::from_byte(0x00), None);
    }

    #[test]
    fn erase_encodings() {
        assert_eq!(Erase::Global.command(), Command::Erase);
        assert_eq!(Erase::Global.encode(), Ok(vec![0xFF, 0x00]));

        assert_eq!(Erase::Pages(vec![0x01, 0x02]).encode(), Ok(vec![0x01, 0x01, 0x02, 0x01 ^ 0x01 ^ 0x02]));

        assert_eq!(Erase::ExtendedGlobal.command(), Command::ExtendedErase);
        assert_eq!(Erase::ExtendedGlobal.encode(), Ok(vec![0xFF, 0xFF, 0x00]));

        assert_eq!(
            Erase::ExtendedPages(vec![0x0001, 0x0102]).encode(),
            Ok(vec![0x00, 0x01, 0x00, 0x01, 0x01, 0x02, 0x01 ^ 0x01 ^ 0x01 ^ 0x02])
        );
    }

    #[test]
    fn erase_rejects_bad_page_counts() {
        assert_eq!(Erase::Pages(vec![]).encode(), Err(FrameError::Empty));
        assert_eq!(
            Erase::Pages(vec![0; 256]).encode(),
            Err(FrameError::TooLong { len: 256, max: MAX_ERASE_PAGES })
        );
        assert_eq!(Erase::ExtendedPages(vec![]).encode(), Err(FrameError::Empty));
    }
}
