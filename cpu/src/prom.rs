//! Boot PROM image loader.
//!
//! A PROM file starts with three 32-bit header words (a format code,
//! the load start address and the word count), followed by one group
//! of four 16-bit words per microinstruction, packed high half
//! first.  The 16-bit quantities are little-endian byte pairs; the
//! 32-bit header words use the PDP-style mixed byte order
//! b1,b0,b3,b2.

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read};

use tracing::{event, Level};

use base::prelude::Microword;

pub const PROM_WORDS: usize = 512;

#[derive(Debug)]
pub enum PromError {
    Io(io::Error),
    /// The header claims more words than the PROM can hold.
    BadExtent { start: u32, size: u32 },
}

impl Display for PromError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            PromError::Io(e) => write!(f, "reading PROM image failed: {e}"),
            PromError::BadExtent { start, size } => write!(
                f,
                "PROM header start {start} size {size} does not fit in {PROM_WORDS} words"
            ),
        }
    }
}

impl error::Error for PromError {}

impl From<io::Error> for PromError {
    fn from(e: io::Error) -> PromError {
        PromError::Io(e)
    }
}

fn read16<R: Read>(input: &mut R) -> Result<u16, PromError> {
    let mut b = [0u8; 2];
    input.read_exact(&mut b)?;
    Ok((u16::from(b[1]) << 8) | u16::from(b[0]))
}

fn read32<R: Read>(input: &mut R) -> Result<u32, PromError> {
    let mut b = [0u8; 4];
    input.read_exact(&mut b)?;
    Ok((u32::from(b[1]) << 24) | (u32::from(b[0]) << 16) | (u32::from(b[3]) << 8) | u32::from(b[2]))
}

/// Load a PROM image, returning the full 512-word PROM contents.
pub fn load_prom<R: Read>(input: &mut R) -> Result<Box<[Microword; PROM_WORDS]>, PromError> {
    let code = read32(input)?;
    let start = read32(input)?;
    let size = read32(input)?;
    event!(Level::INFO, "prom: code: {}, start: {}, size: {}", code, start, size);

    if start as usize + size as usize > PROM_WORDS {
        return Err(PromError::BadExtent { start, size });
    }

    let mut prom = Box::new([Microword::default(); PROM_WORDS]);
    for loc in start as usize..(start + size) as usize {
        let w1 = u64::from(read16(input)?);
        let w2 = u64::from(read16(input)?);
        let w3 = u64::from(read16(input)?);
        let w4 = u64::from(read16(input)?);
        prom[loc] = Microword::from_bits((w1 << 48) | (w2 << 32) | (w3 << 16) | w4);
    }
    Ok(prom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Encode a u32 in the header's mixed byte order.
    fn put32(out: &mut Vec<u8>, v: u32) {
        out.push((v >> 16) as u8);
        out.push((v >> 24) as u8);
        out.push(v as u8);
        out.push((v >> 8) as u8);
    }

    fn put16(out: &mut Vec<u8>, v: u16) {
        out.push(v as u8);
        out.push((v >> 8) as u8);
    }

    #[test]
    fn loads_words_at_the_start_address() {
        let mut image = Vec::new();
        put32(&mut image, 1); // code
        put32(&mut image, 2); // start
        put32(&mut image, 1); // size
        put16(&mut image, 0o123456);
        put16(&mut image, 0o001122);
        put16(&mut image, 0o054321);
        put16(&mut image, 0o170017);

        let prom = load_prom(&mut Cursor::new(&image)).expect("image is well formed");
        assert_eq!(prom[0].bits(), 0);
        assert_eq!(
            prom[2].bits(),
            (0o123456u64 << 48) | (0o001122u64 << 32) | (0o054321u64 << 16) | 0o170017
        );
        assert_eq!(prom[3].bits(), 0);
    }

    #[test]
    fn truncated_image_is_an_error() {
        let mut image = Vec::new();
        put32(&mut image, 1);
        put32(&mut image, 0);
        put32(&mut image, 4); // claims 4 words but provides none
        assert!(matches!(
            load_prom(&mut Cursor::new(&image)),
            Err(PromError::Io(_))
        ));
    }

    #[test]
    fn oversized_extent_is_rejected() {
        let mut image = Vec::new();
        put32(&mut image, 1);
        put32(&mut image, 510);
        put32(&mut image, 4);
        assert!(matches!(
            load_prom(&mut Cursor::new(&image)),
            Err(PromError::BadExtent { start: 510, size: 4 })
        ));
    }
}
