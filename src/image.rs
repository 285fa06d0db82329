//! Utilities for working with flash images.
//!
//! An image is a small header describing the geometry, followed by every word of the device in
//! little-endian order. Both the header and the payload are protected by a CRC.

use std::io::{Read, Write};
use std::mem::size_of;

use anyhow::{ensure, Context};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use crate::driver::FlashGeometry;

pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const IMAGE_VERSION: u8 = 1;

/// Size of the encoded [ImageHeader], magic included
const IMAGE_HEADER_SIZE: usize = 4 + 1 + 5 * size_of::<u32>();

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"NORI")]
pub struct ImageHeader {
    pub version: u8,
    pub total_blocks: u32,
    pub words_per_block: u32,
    pub sector_words: u32,
    pub payload_crc: u32,

    /// Covers every byte before it
    pub hdr_crc: u32,
}

impl ImageHeader {
    fn compute_crc(&self) -> anyhow::Result<u32> {
        let header_bytes = self.to_bytes()?;
        let header_len = header_bytes.len() - size_of::<u32>();
        Ok(IMAGE_CRC.checksum(&header_bytes[..header_len]))
    }

    /// The geometry recorded in this header; images are always based at address 0
    pub fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            base_address: 0,
            total_blocks: self.total_blocks,
            words_per_block: self.words_per_block,
            sector_words: self.sector_words,
        }
    }
}

/// Write `words`, the full contents of a device with the given geometry, as an image.
pub fn write_image<W: Write>(
    write: &mut W,
    geometry: FlashGeometry,
    words: &[u32],
) -> anyhow::Result<()> {
    ensure!(
        words.len() == geometry.total_words(),
        "{} words given for a {}-word device",
        words.len(),
        geometry.total_words()
    );

    let payload: Vec<u8> = words.iter().flat_map(|x| x.to_le_bytes()).collect();

    let mut header = ImageHeader {
        version: IMAGE_VERSION,
        total_blocks: geometry.total_blocks,
        words_per_block: geometry.words_per_block,
        sector_words: geometry.sector_words,
        payload_crc: IMAGE_CRC.checksum(&payload),
        hdr_crc: 0,
    };
    header.hdr_crc = header.compute_crc()?;

    write.write_all(&header.to_bytes()?)?;
    write.write_all(&payload)?;
    Ok(())
}

/// Read an image back, returning the device geometry and contents.
pub fn read_image<R: Read>(read: &mut R) -> anyhow::Result<(FlashGeometry, Vec<u32>)> {
    let mut header_bytes = [0; IMAGE_HEADER_SIZE];
    read.read_exact(&mut header_bytes)
        .context("image too short for a header")?;

    let (_, header) =
        ImageHeader::from_bytes((&header_bytes[..], 0)).context("flash image header not found")?;
    ensure!(
        header.version == IMAGE_VERSION,
        "unsupported image version {}",
        header.version
    );
    ensure!(
        header.hdr_crc == header.compute_crc()?,
        "image header CRC mismatch"
    );

    let geometry = header.geometry();
    let mut payload = vec![0; geometry.total_words() * size_of::<u32>()];
    read.read_exact(&mut payload)
        .context("image shorter than its geometry")?;
    ensure!(
        IMAGE_CRC.checksum(&payload) == header.payload_crc,
        "image payload CRC mismatch"
    );

    let words = payload
        .chunks_exact(size_of::<u32>())
        .map(|x| u32::from_le_bytes([x[0], x[1], x[2], x[3]]))
        .collect();

    Ok((geometry, words))
}
