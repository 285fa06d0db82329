//! Flash driver implementation over the Linux MTD subsystem
//!
//! Words are stored little-endian. NOR MTD devices program at single-byte granularity, so word
//! writes land exactly where they are addressed.

use super::{
    DriverInfo, DriverResult, DriverStatus, FlashDriver, FlashGeometry, VerifyShape, WordsUtil,
};

use anyhow::bail;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::{size_of, MaybeUninit};
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

const WORD_BYTES: u64 = size_of::<u32>() as u64;

/// Flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNor {
    file: File,
    geometry: FlashGeometry,
}

impl MtdNor {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0"), carving it into sectors of
    /// `sector_words` words
    pub fn open<P: AsRef<Path>>(path: P, sector_words: u32) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };
        let geometry = info.geometry(sector_words)?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str, sector_words: u32) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap_or_default();
                return Self::open(Path::new("/dev").join(mtd_dev), sector_words);
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the byte offset of a word range, ensuring it lies within the device
    fn offset_for(&self, address: u32, words: usize) -> DriverResult<u64> {
        let begin = address
            .checked_sub(self.geometry.base_address)
            .ok_or(DriverStatus::OUT_OF_RANGE)? as usize;
        if begin + words > self.geometry.total_words() {
            return Err(DriverStatus::OUT_OF_RANGE);
        }
        Ok(begin as u64 * WORD_BYTES)
    }
}

impl FlashDriver for MtdNor {
    fn initialize(&mut self) -> DriverResult<DriverInfo> {
        Ok(DriverInfo {
            geometry: self.geometry,
            direct_read: false,
            sector_buffer: Some(vec![0; self.geometry.sector_words as usize].into_boxed_slice()),
            verify_shape: VerifyShape::IndexOnly,
        })
    }

    fn read(&mut self, address: u32, words: &mut [u32]) -> DriverResult<()> {
        let offset = self.offset_for(address, words.len())?;
        let mut bytes = vec![0u8; words.len() * WORD_BYTES as usize];
        self.file.read_exact_at(&mut bytes, offset).map_err(|e| {
            log::debug!("MTD read at {offset:#x} failed: {e}");
            DriverStatus::READ_FAILED
        })?;

        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD_BYTES as usize)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap_or_default());
        }
        Ok(())
    }

    fn write(&mut self, address: u32, words: &[u32]) -> DriverResult<()> {
        let offset = self.offset_for(address, words.len())?;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.file.write_all_at(&bytes, offset).map_err(|e| {
            log::debug!("MTD write at {offset:#x} failed: {e}");
            DriverStatus::WRITE_FAILED
        })
    }

    fn block_erase(&mut self, block: u32, _erase_count_hint: u32) -> DriverResult<()> {
        if block >= self.geometry.total_blocks {
            return Err(DriverStatus::OUT_OF_RANGE);
        }

        let size = self.geometry.words_per_block * WORD_BYTES as u32;
        let erase_info = ioctl::erase_info_user {
            start: size * block,
            length: size,
        };
        unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) }.map_err(|e| {
            log::debug!("MTD erase of block {block} failed: {e}");
            DriverStatus::ERASE_FAILED
        })?;
        Ok(())
    }

    fn block_erased_verify(
        &mut self,
        _instance: Option<&FlashGeometry>,
        block: u32,
    ) -> DriverResult<()> {
        if block >= self.geometry.total_blocks {
            return Err(DriverStatus::OUT_OF_RANGE);
        }

        let mut words = vec![0u32; self.geometry.words_per_block as usize];
        self.read(self.geometry.block_address(block), &mut words)?;
        if words.is_erased() {
            Ok(())
        } else {
            Err(DriverStatus::NOT_ERASED)
        }
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{FlashGeometry, WORD_BYTES};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl mtd_info_user {
        pub fn geometry(&self, sector_words: u32) -> anyhow::Result<FlashGeometry> {
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                u64::from(self.erasesize) % WORD_BYTES == 0,
                "MTD erasesize not a whole number of words"
            );
            ensure!(
                u64::from(self.writesize) <= WORD_BYTES,
                "MTD writesize {} too coarse for word programming",
                self.writesize
            );

            Ok(FlashGeometry {
                base_address: 0,
                total_blocks: self.size / self.erasesize,
                words_per_block: self.erasesize / WORD_BYTES as u32,
                sector_words,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
}
