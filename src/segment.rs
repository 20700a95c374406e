//! Segments: the zone-sized, bump-allocated containers that hold
//! inode and data blocks.

use std::collections::HashMap;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use crate::block::{Block, BlockType, DataBody, DirDataBody, InodeBody, BlockMeta};
use crate::error::{Error, Result};
use crate::ftl::Ftl;

/// Whole LBAs reserved at the front of every segment for the bump
/// pointer, (segment 0 only) the persisted id counter, and the inode
/// map. One LBA comfortably holds the inode map for any zone size used
/// in practice.
pub const RESERVE_LBAS: u32 = 1;

/// One `(inode_id, global_offset)` inode-map entry, 16 bytes on disk.
const INODE_MAP_ENTRY_SIZE: usize = 16;

pub struct Segment {
    pub index: u32,
    pub addr_start: u64,
    segment_bytes: u64,
    lba_size: u32,
    reserve_bytes: u64,
    /// In-memory mirror of bytes `[0, cur_size)` of the segment.
    buffer: Vec<u8>,
    /// Bump pointer: next free byte offset within the segment.
    cur_size: u64,
    /// In-segment byte offset up to which the device is known to
    /// already hold what `buffer` holds, as of the last successful
    /// `flush`. A partial flush only needs to push `[flushed_size,
    /// cur_size)`, LBA-aligned, plus the header region.
    flushed_size: u64,
    /// inode id -> global offset, for every inode block this segment owns.
    inode_map: HashMap<u64, u64>,
    /// Lazily-parsed block cache, keyed by in-segment byte offset.
    blocks: HashMap<u64, Block>,
    pub dirty: bool,
    pub last_modify: Instant,
}

impl Segment {
    /// Builds a fresh, empty segment (used the first time a segment
    /// index is allocated, before anything has been written to it).
    pub fn new_empty(index: u32, segment_bytes: u64, lba_size: u32) -> Self {
        let reserve_bytes = RESERVE_LBAS as u64 * lba_size as u64;
        let header_bytes = if index == 0 { 16 } else { 8 };
        let mut buffer = vec![0u8; reserve_bytes as usize];
        LittleEndian::write_u64(
            &mut buffer[header_bytes - 8..header_bytes],
            reserve_bytes,
        );
        Segment {
            index,
            addr_start: index as u64 * segment_bytes,
            segment_bytes,
            lba_size,
            reserve_bytes,
            buffer,
            cur_size: reserve_bytes,
            flushed_size: 0,
            inode_map: HashMap::new(),
            blocks: HashMap::new(),
            dirty: true,
            last_modify: Instant::now(),
        }
    }

    fn header_bytes(&self) -> usize {
        if self.index == 0 {
            16
        } else {
            8
        }
    }

    /// Loads an existing segment's header, inode map, and bump pointer
    /// from the device. Block bodies are parsed lazily via
    /// [`Segment::block`].
    pub fn load(ftl: &Ftl, index: u32, segment_bytes: u64, lba_size: u32) -> Result<Self> {
        let addr_start = index as u64 * segment_bytes;
        let mut buffer = vec![0u8; segment_bytes as usize];
        let lba = addr_start / lba_size as u64;
        ftl.read(lba, &mut buffer, segment_bytes as usize)?;

        let header_bytes = if index == 0 { 16 } else { 8 };
        let cur_size = LittleEndian::read_u64(&buffer[header_bytes - 8..header_bytes]);

        let reserve_bytes = RESERVE_LBAS as u64 * lba_size as u64;
        let mut inode_map = HashMap::new();
        let mut off = header_bytes;
        while off + INODE_MAP_ENTRY_SIZE <= reserve_bytes as usize {
            let id = LittleEndian::read_u64(&buffer[off..off + 8]);
            let offset = LittleEndian::read_u64(&buffer[off + 8..off + 16]);
            if id == 0 && offset == 0 {
                break;
            }
            inode_map.insert(id, offset);
            off += INODE_MAP_ENTRY_SIZE;
        }

        buffer.truncate(cur_size.max(reserve_bytes) as usize);

        Ok(Segment {
            index,
            addr_start,
            segment_bytes,
            lba_size,
            reserve_bytes,
            buffer,
            cur_size,
            flushed_size: cur_size,
            inode_map,
            blocks: HashMap::new(),
            dirty: false,
            last_modify: Instant::now(),
        })
    }

    pub fn remaining(&self) -> u64 {
        self.segment_bytes - self.cur_size
    }

    /// Global offset of the first still-unused byte in this segment.
    pub fn cur_global_offset(&self) -> u64 {
        self.addr_start + self.cur_size
    }

    fn write_inode_map_entry(&mut self, id: u64, offset: u64) -> Result<()> {
        let header_bytes = self.header_bytes();
        let slot = header_bytes + self.inode_map.len() * INODE_MAP_ENTRY_SIZE;
        if slot + INODE_MAP_ENTRY_SIZE > self.reserve_bytes as usize {
            return Err(Error::NoSpace);
        }
        let mut entry = [0u8; INODE_MAP_ENTRY_SIZE];
        LittleEndian::write_u64(&mut entry[0..8], id);
        LittleEndian::write_u64(&mut entry[8..16], offset);
        self.buffer[slot..slot + INODE_MAP_ENTRY_SIZE].copy_from_slice(&entry);
        self.inode_map.insert(id, offset);
        Ok(())
    }

    /// Allocates a new FILE_INODE or DIR_INODE at the bump pointer.
    pub fn allocate_new(&mut self, id: u64, is_dir: bool, name: String) -> Result<u64> {
        if self.inode_map.len() * INODE_MAP_ENTRY_SIZE + self.header_bytes() + INODE_MAP_ENTRY_SIZE
            > self.reserve_bytes as usize
        {
            return Err(Error::NoSpace);
        }
        let capacity = self.lba_size as usize;
        if self.remaining() < capacity as u64 {
            return Err(Error::NoSpace);
        }
        let global_offset = self.cur_global_offset();
        let meta = BlockMeta {
            id,
            segment_addr: self.addr_start,
            global_offset,
            loaded: true,
        };
        let body = InodeBody {
            meta,
            next: 0,
            prev: 0,
            name,
            offsets: Vec::new(),
        };
        let block = if is_dir {
            Block::DirInode(body)
        } else {
            Block::FileInode(body)
        };
        let mut bytes = Vec::with_capacity(capacity);
        let written = block.serialize(self.lba_size as usize, &mut bytes)?;
        self.place(written, &bytes, global_offset)?;
        self.write_inode_map_entry(id, global_offset)?;
        self.blocks.insert(global_offset - self.addr_start, block);
        self.dirty = true;
        self.last_modify = Instant::now();
        Ok(global_offset)
    }

    /// Allocates a FILE_DATA or DIR_DATA block holding `payload`. The
    /// caller is responsible for pre-truncating `payload` to what fits;
    /// this returns `NoSpace` if it doesn't.
    pub fn allocate_data(&mut self, id: u64, payload: &[u8], is_dir: bool) -> Result<u64> {
        let global_offset = self.cur_global_offset();
        let block = if is_dir {
            let attrs = payload
                .chunks(crate::block::FILE_ATTR_SIZE)
                .map(crate::block::FileAttr::deserialize)
                .collect::<Result<Vec<_>>>()?;
            Block::DirData(DirDataBody {
                meta: BlockMeta {
                    id,
                    segment_addr: self.addr_start,
                    global_offset,
                    loaded: true,
                },
                attrs,
            })
        } else {
            Block::FileData(DataBody {
                meta: BlockMeta {
                    id,
                    segment_addr: self.addr_start,
                    global_offset,
                    loaded: true,
                },
                content: payload.to_vec(),
            })
        };
        let mut bytes = Vec::new();
        let written = block.serialize(self.lba_size as usize, &mut bytes)?;
        self.place(written, &bytes, global_offset)?;
        self.blocks.insert(global_offset - self.addr_start, block);
        self.dirty = true;
        self.last_modify = Instant::now();
        Ok(global_offset)
    }

    /// Maximum payload `allocate_data` can accept right now without
    /// exceeding the segment's remaining space.
    pub fn data_budget(&self) -> u64 {
        self.remaining().saturating_sub(9)
    }

    fn place(&mut self, written: usize, bytes: &[u8], global_offset: u64) -> Result<()> {
        if written as u64 > self.remaining() {
            return Err(Error::NoSpace);
        }
        let in_segment = (global_offset - self.addr_start) as usize;
        if self.buffer.len() < in_segment + written {
            self.buffer.resize(in_segment + written, 0);
        }
        self.buffer[in_segment..in_segment + written].copy_from_slice(bytes);
        self.cur_size += written as u64;
        Ok(())
    }

    /// Returns the block at in-segment `global_offset`, parsing it from
    /// the resident buffer on first access.
    pub fn block(&mut self, global_offset: u64) -> Result<&Block> {
        let in_segment = global_offset - self.addr_start;
        if !self.blocks.contains_key(&in_segment) {
            let slice = &self.buffer[in_segment as usize..];
            let (block, _len) =
                Block::deserialize(slice, self.addr_start, global_offset, self.lba_size as usize)?
                    .ok_or(Error::NotFound)?;
            self.blocks.insert(in_segment, block);
        }
        Ok(self.blocks.get(&in_segment).unwrap())
    }

    pub fn block_mut(&mut self, global_offset: u64) -> Result<&mut Block> {
        self.block(global_offset)?;
        let in_segment = global_offset - self.addr_start;
        Ok(self.blocks.get_mut(&in_segment).unwrap())
    }

    /// Rewrites `block`'s on-disk bytes in place (used when an inode's
    /// `offsets`/`next`/`prev` change, or a DIR_DATA block gains an
    /// entry). Only valid for blocks whose serialized size is unchanged
    /// or growing into already-reserved trailing space within this
    /// segment's buffer; callers must pre-check via the appropriate
    /// capacity helper.
    pub fn rewrite(&mut self, global_offset: u64) -> Result<()> {
        let in_segment = (global_offset - self.addr_start) as usize;
        let block = self
            .blocks
            .get(&in_segment)
            .ok_or(Error::NotFound)?
            .clone();
        let mut bytes = Vec::new();
        let written = block.serialize(self.lba_size as usize, &mut bytes)?;
        if self.buffer.len() < in_segment + written {
            self.buffer.resize(in_segment + written, 0);
        }
        self.buffer[in_segment..in_segment + written].copy_from_slice(&bytes);
        self.dirty = true;
        self.last_modify = Instant::now();
        Ok(())
    }

    /// Writes this segment's resident buffer back to the device. The
    /// reserved header (bump pointer, id counter, inode map) is always
    /// re-flushed, since an allocation can touch it regardless of where
    /// the bump pointer currently sits. When `partial` is true, only
    /// the LBA-aligned range spanning `[flushed_size, cur_size)` is
    /// flushed beyond that; when `false`, the whole data region up to
    /// `cur_size` is (used for the first flush of a loaded/rebuilt
    /// segment and for segment-GC's full rewrite).
    pub fn flush(&mut self, ftl: &Ftl, partial: bool) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.write_range(ftl, 0, self.reserve_bytes)?;

        let lba_size = self.lba_size as u64;
        let (start, end) = if partial {
            let start = (self.flushed_size.max(self.reserve_bytes) / lba_size) * lba_size;
            let end = (((self.cur_size + lba_size - 1) / lba_size) * lba_size).min(self.segment_bytes);
            (start, end)
        } else {
            (self.reserve_bytes, self.cur_size.min(self.segment_bytes))
        };
        if end > start {
            self.write_range(ftl, start, end)?;
        }
        self.flushed_size = self.cur_size;
        self.dirty = false;
        Ok(())
    }

    /// Writes in-segment byte range `[start, end)` to the device,
    /// zero-filling any portion beyond what `buffer` currently holds.
    /// `start`/`end` must already be LBA-aligned.
    fn write_range(&self, ftl: &Ftl, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Ok(());
        }
        let len = (end - start) as usize;
        let mut out = vec![0u8; len];
        let avail = self.buffer.len() as u64;
        let copy_end = end.min(avail);
        if copy_end > start {
            let copy_len = (copy_end - start) as usize;
            out[..copy_len].copy_from_slice(&self.buffer[start as usize..copy_end as usize]);
        }
        let lba = (self.addr_start + start) / self.lba_size as u64;
        ftl.write(lba, &out, len)
    }

    /// Drops cached block bodies and the resident buffer tail beyond
    /// the reserved header, keeping only what's needed to resume
    /// allocation (`cur_size`, `inode_map`). Rehydrated lazily by
    /// [`Segment::block`] on next access, which re-reads from the
    /// device.
    pub fn offload(&mut self, ftl: &Ftl) -> Result<()> {
        self.flush(ftl, false)?;
        self.blocks.clear();
        self.buffer.truncate(self.reserve_bytes as usize);
        Ok(())
    }

    pub fn is_empty_of_live_blocks(&self) -> bool {
        self.inode_map.is_empty()
    }

    /// This segment's inode id -> global offset map.
    pub fn inode_map(&self) -> &HashMap<u64, u64> {
        &self.inode_map
    }

    pub fn block_type_at(&mut self, global_offset: u64) -> Result<BlockType> {
        Ok(self.block(global_offset)?.block_type())
    }

    /// The persisted inode-id counter. Only segment 0 carries one.
    pub fn id_counter(&self) -> Option<u64> {
        if self.index == 0 {
            Some(LittleEndian::read_u64(&self.buffer[0..8]))
        } else {
            None
        }
    }

    pub fn set_id_counter(&mut self, value: u64) -> Result<()> {
        if self.index != 0 {
            return Err(Error::InvalidArgument(
                "id counter is only persisted in segment 0".into(),
            ));
        }
        LittleEndian::write_u64(&mut self.buffer[0..8], value);
        self.dirty = true;
        Ok(())
    }
}
