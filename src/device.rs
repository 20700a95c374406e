//! The device facade: the narrow set of ZNS primitives the FTL
//! consumes (`zone_report` via [`Geometry`], `zone_reset`,
//! `zone_append`, and `read`), plus MDTS (maximum data transfer size)
//! chunking of any I/O larger than the device allows in one call.
//! [`ZoneDevice`] is that narrow interface; [`FileBackedDevice`] is a
//! reference implementation over a regular file, used by the crate's
//! own tests and by embedders that want to exercise the FTL/filesystem
//! stack without real ZNS hardware.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Immutable device geometry, as reported by `zone_report` at mount time.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Total number of zones on the device.
    pub zones: u32,
    /// Number of LBA-sized blocks per zone.
    pub blocks_per_zone: u32,
    /// Size in bytes of one LBA.
    pub lba_size: u32,
    /// Maximum data transfer size, in bytes, for a single device I/O.
    pub mdts: u32,
}

impl Geometry {
    pub fn zone_bytes(&self) -> u64 {
        self.blocks_per_zone as u64 * self.lba_size as u64
    }

    /// Byte offset of the start of zone `zone_no`.
    pub fn zone_start_lba(&self, zone_no: u32) -> u64 {
        zone_no as u64 * self.blocks_per_zone as u64
    }
}

/// The narrow set of operations the FTL consumes from a ZNS device.
pub trait ZoneDevice: Send + Sync {
    fn geometry(&self) -> Geometry;

    /// Reads `n` bytes (a multiple of the LBA size) starting at LBA `lba`.
    fn read(&self, lba: u64, buf: &mut [u8], n: usize) -> Result<()>;

    /// Appends `n` bytes (a multiple of the LBA size) to the zone whose
    /// start LBA is `zone_slba`. Returns the physical LBA the device
    /// chose for the first block written.
    fn append(&self, zone_slba: u64, buf: &[u8], n: usize) -> Result<u64>;

    /// Resets (erases) the zone whose start LBA is `zone_slba`, moving
    /// its write pointer back to zero.
    fn reset(&self, zone_slba: u64) -> Result<()>;
}

/// Splits a logical I/O of `total` bytes into device I/Os no larger
/// than `mdts` bytes each, calling `op(offset, len)` for each chunk in
/// order. Used for both the FTL's zone-append/read path and the GC's
/// zone-rewrite path.
pub fn chunked_io<F>(total: usize, mdts: usize, mut op: F) -> Result<()>
where
    F: FnMut(usize, usize) -> Result<()>,
{
    let mdts = mdts.max(1);
    let mut offset = 0;
    while offset < total {
        let len = (total - offset).min(mdts);
        op(offset, len)?;
        offset += len;
    }
    Ok(())
}

/// A reference [`ZoneDevice`] backed by a regular file, used in tests
/// and by any embedder without real ZNS hardware. Write-pointer state
/// per zone is tracked in memory; `reset` truncates the corresponding
/// region to zero bytes of content (logically) by resetting the
/// recorded pointer, mirroring a real device's zone reset semantics
/// without needing TRIM/discard support from the host filesystem.
pub struct FileBackedDevice {
    file: std::sync::Mutex<File>,
    geometry: Geometry,
    /// Per-zone write pointer, in LBAs relative to the zone start.
    write_pointers: std::sync::Mutex<Vec<u32>>,
}

impl FileBackedDevice {
    /// Opens (creating if needed) a file-backed device at `path`, sized
    /// to hold `geometry.zones` zones. If `force_reset` is set, the
    /// backing file is truncated and all write pointers start at zero.
    pub fn open(path: &Path, geometry: Geometry, force_reset: bool) -> Result<Self> {
        let total_bytes = geometry.zones as u64 * geometry.zone_bytes();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(force_reset)
            .open(path)?;
        file.set_len(total_bytes)?;
        let write_pointers = vec![0u32; geometry.zones as usize];
        Ok(Self {
            file: std::sync::Mutex::new(file),
            geometry,
            write_pointers: std::sync::Mutex::new(write_pointers),
        })
    }

    fn zone_of(&self, lba: u64) -> u32 {
        (lba / self.geometry.blocks_per_zone as u64) as u32
    }
}

impl ZoneDevice for FileBackedDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&self, lba: u64, buf: &mut [u8], n: usize) -> Result<()> {
        if n % self.geometry.lba_size as usize != 0 {
            return Err(Error::InvalidArgument(format!(
                "read size {n} is not a multiple of LBA size {}",
                self.geometry.lba_size
            )));
        }
        let byte_offset = lba * self.geometry.lba_size as u64;
        let mdts = self.geometry.mdts as usize;
        let mut file = self.file.lock().unwrap();
        chunked_io(n, mdts, |off, len| {
            file.seek(SeekFrom::Start(byte_offset + off as u64))?;
            file.read_exact(&mut buf[off..off + len])?;
            Ok(())
        })
    }

    fn append(&self, zone_slba: u64, buf: &[u8], n: usize) -> Result<u64> {
        if n % self.geometry.lba_size as usize != 0 {
            return Err(Error::InvalidArgument(format!(
                "append size {n} is not a multiple of LBA size {}",
                self.geometry.lba_size
            )));
        }
        let zone_no = self.zone_of(zone_slba);
        let n_lbas = (n / self.geometry.lba_size as usize) as u32;

        let mut pointers = self.write_pointers.lock().unwrap();
        let wp = pointers[zone_no as usize];
        if wp + n_lbas > self.geometry.blocks_per_zone {
            return Err(Error::NoSpace);
        }
        let start_lba = zone_slba + wp as u64;
        let byte_offset = start_lba * self.geometry.lba_size as u64;
        let mdts = self.geometry.mdts as usize;
        {
            let mut file = self.file.lock().unwrap();
            chunked_io(n, mdts, |off, len| {
                file.seek(SeekFrom::Start(byte_offset + off as u64))?;
                file.write_all(&buf[off..off + len])?;
                Ok(())
            })?;
        }
        pointers[zone_no as usize] = wp + n_lbas;
        Ok(start_lba)
    }

    fn reset(&self, zone_slba: u64) -> Result<()> {
        let zone_no = self.zone_of(zone_slba);
        let byte_offset = zone_slba * self.geometry.lba_size as u64;
        let zero = vec![0u8; self.geometry.lba_size as usize];
        let mut file = self.file.lock().unwrap();
        for i in 0..self.geometry.blocks_per_zone as u64 {
            file.seek(SeekFrom::Start(byte_offset + i * self.geometry.lba_size as u64))?;
            file.write_all(&zero)?;
        }
        drop(file);
        self.write_pointers.lock().unwrap()[zone_no as usize] = 0;
        Ok(())
    }
}
