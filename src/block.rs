//! Polymorphic on-media block records: file-inode, file-data,
//! dir-inode, dir-data, plus the fixed-size `FileAttr` record embedded
//! in directory data.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

use crate::error::{Error, Result};

/// Longest name (in bytes) a directory entry or dir-inode may carry.
pub const MAX_NAME_LENGTH: usize = 32;

/// One length byte + the fixed name field + size/create_time/offset/inode_id.
/// The length prefix lets a name of exactly `MAX_NAME_LENGTH` bytes
/// round-trip unambiguously instead of relying on zero-termination.
pub const FILE_ATTR_SIZE: usize = 1 + MAX_NAME_LENGTH + 8 + 8 + 8 + 8;

const_assert!(FILE_ATTR_SIZE == 65);
const_assert!(MAX_NAME_LENGTH <= u8::MAX as usize);

/// High bit of `FileAttr::size`'s on-disk encoding, marking a directory.
const IS_DIR_BIT: u64 = 1 << 63;

/// Tag nibble 0 is reserved for an on-disk hole (a deleted or
/// never-written block); every real block type's tag starts at 1 so a
/// raw zero byte read back from a freshly-loaded segment never parses
/// as a live `FileInode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    FileInode = 1,
    FileData = 2,
    DirInode = 3,
    DirData = 4,
}

impl BlockType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag >> 4 {
            1 => Ok(BlockType::FileInode),
            2 => Ok(BlockType::FileData),
            3 => Ok(BlockType::DirInode),
            4 => Ok(BlockType::DirData),
            _ => Err(Error::Corruption { tag }),
        }
    }

    fn tag_byte(self) -> u8 {
        (self as u8) << 4
    }
}

/// A directory entry: maps a child name to its inode's global offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub create_time: u64,
    /// Global offset of the child inode block.
    pub offset: u64,
    pub inode_id: u64,
}

impl FileAttr {
    pub fn validate_name(name: &str) -> Result<()> {
        if name.as_bytes().len() > MAX_NAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "name {name:?} exceeds MAX_NAME_LENGTH ({MAX_NAME_LENGTH})"
            )));
        }
        Ok(())
    }

    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        Self::validate_name(&self.name)?;
        let name_bytes = self.name.as_bytes();
        out.push(name_bytes.len() as u8);
        let mut field = [0u8; MAX_NAME_LENGTH];
        field[..name_bytes.len()].copy_from_slice(name_bytes);
        out.extend_from_slice(&field);
        let mut size_field = self.size;
        if self.is_dir {
            size_field |= IS_DIR_BIT;
        }
        let mut buf8 = [0u8; 8];
        LittleEndian::write_u64(&mut buf8, size_field);
        out.extend_from_slice(&buf8);
        LittleEndian::write_u64(&mut buf8, self.create_time);
        out.extend_from_slice(&buf8);
        LittleEndian::write_u64(&mut buf8, self.offset);
        out.extend_from_slice(&buf8);
        LittleEndian::write_u64(&mut buf8, self.inode_id);
        out.extend_from_slice(&buf8);
        Ok(())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_ATTR_SIZE {
            return Err(Error::Corruption { tag: 0 });
        }
        let name_len = bytes[0] as usize;
        if name_len > MAX_NAME_LENGTH {
            return Err(Error::Corruption { tag: bytes[0] });
        }
        let name = String::from_utf8_lossy(&bytes[1..1 + name_len]).into_owned();
        let mut off = 1 + MAX_NAME_LENGTH;
        let size_field = LittleEndian::read_u64(&bytes[off..off + 8]);
        off += 8;
        let create_time = LittleEndian::read_u64(&bytes[off..off + 8]);
        off += 8;
        let offset = LittleEndian::read_u64(&bytes[off..off + 8]);
        off += 8;
        let inode_id = LittleEndian::read_u64(&bytes[off..off + 8]);
        Ok(FileAttr {
            name,
            size: size_field & !IS_DIR_BIT,
            is_dir: size_field & IS_DIR_BIT != 0,
            create_time,
            offset,
            inode_id,
        })
    }
}

/// Common metadata every block variant carries.
#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub id: u64,
    /// Base LBA of the segment this block lives in.
    pub segment_addr: u64,
    /// Global offset (segment base bytes + in-segment byte offset).
    pub global_offset: u64,
    pub loaded: bool,
}

/// The four on-media block variants.
#[derive(Debug, Clone)]
pub enum Block {
    FileInode(InodeBody),
    DirInode(InodeBody),
    FileData(DataBody),
    DirData(DirDataBody),
}

/// Shared body for FILE_INODE and DIR_INODE.
#[derive(Debug, Clone)]
pub struct InodeBody {
    pub meta: BlockMeta,
    /// Global offset of the next inode in the chain, or 0 if none.
    pub next: u64,
    /// Global offset of the previous inode in the chain, or 0 if none.
    pub prev: u64,
    /// Name of the defining directory entry; only meaningful for DIR_INODE.
    pub name: String,
    /// Global offsets of owned data blocks, in append order.
    pub offsets: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct DataBody {
    pub meta: BlockMeta,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DirDataBody {
    pub meta: BlockMeta,
    pub attrs: Vec<FileAttr>,
}

impl Block {
    pub fn meta(&self) -> &BlockMeta {
        match self {
            Block::FileInode(b) | Block::DirInode(b) => &b.meta,
            Block::FileData(b) => &b.meta,
            Block::DirData(b) => &b.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut BlockMeta {
        match self {
            Block::FileInode(b) | Block::DirInode(b) => &mut b.meta,
            Block::FileData(b) => &mut b.meta,
            Block::DirData(b) => &mut b.meta,
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Block::FileInode(_) => BlockType::FileInode,
            Block::DirInode(_) => BlockType::DirInode,
            Block::FileData(_) => BlockType::FileData,
            Block::DirData(_) => BlockType::DirData,
        }
    }

    pub fn as_inode(&self) -> Option<&InodeBody> {
        match self {
            Block::FileInode(b) | Block::DirInode(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_inode_mut(&mut self) -> Option<&mut InodeBody> {
        match self {
            Block::FileInode(b) | Block::DirInode(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dir_data(&self) -> Option<&DirDataBody> {
        match self {
            Block::DirData(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dir_data_mut(&mut self) -> Option<&mut DirDataBody> {
        match self {
            Block::DirData(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_file_data(&self) -> Option<&DataBody> {
        match self {
            Block::FileData(b) => Some(b),
            _ => None,
        }
    }

    /// Fixed on-disk length of an inode block (FILE_INODE/DIR_INODE):
    /// always one full LBA, regardless of how many offsets it holds.
    pub fn inode_capacity(lba_size: usize, is_dir: bool) -> usize {
        let _ = is_dir;
        lba_size
    }

    /// Maximum number of owned-data-block offsets an inode of this
    /// type can hold given the fixed `lba_size`-byte inode layout.
    pub fn max_offsets(lba_size: usize, is_dir: bool) -> usize {
        let fixed = 1 + 8 + 8 + 8 + if is_dir { 1 + MAX_NAME_LENGTH } else { 0 };
        // one slot reserved for the zero-offset terminator
        ((lba_size - fixed) / 8).saturating_sub(1)
    }

    /// Serializes this block into `out`, returning the number of bytes
    /// actually used on media (for FILE_INODE/DIR_INODE this is always
    /// `lba_size`; for the data/dir-data variants it is the tag byte
    /// plus the 8-byte size field plus the payload).
    pub fn serialize(&self, lba_size: usize, out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        out.push(self.block_type().tag_byte());
        match self {
            Block::FileInode(body) | Block::DirInode(body) => {
                let is_dir = matches!(self, Block::DirInode(_));
                let mut buf8 = [0u8; 8];
                LittleEndian::write_u64(&mut buf8, body.next);
                out.extend_from_slice(&buf8);
                LittleEndian::write_u64(&mut buf8, body.prev);
                out.extend_from_slice(&buf8);
                LittleEndian::write_u64(&mut buf8, body.meta.id);
                out.extend_from_slice(&buf8);
                if is_dir {
                    FileAttr::validate_name(&body.name)?;
                    let name_bytes = body.name.as_bytes();
                    out.push(name_bytes.len() as u8);
                    let mut field = [0u8; MAX_NAME_LENGTH];
                    field[..name_bytes.len()].copy_from_slice(name_bytes);
                    out.extend_from_slice(&field);
                }
                let max_offsets = Block::max_offsets(lba_size, is_dir);
                if body.offsets.len() > max_offsets {
                    return Err(Error::NoSpace);
                }
                for &offset in &body.offsets {
                    LittleEndian::write_u64(&mut buf8, offset);
                    out.extend_from_slice(&buf8);
                }
                LittleEndian::write_u64(&mut buf8, 0);
                out.extend_from_slice(&buf8);
                out.resize(start + lba_size, 0);
                Ok(lba_size)
            }
            Block::FileData(body) => {
                let mut buf8 = [0u8; 8];
                LittleEndian::write_u64(&mut buf8, body.content.len() as u64);
                out.extend_from_slice(&buf8);
                out.extend_from_slice(&body.content);
                Ok(out.len() - start)
            }
            Block::DirData(body) => {
                let content_size = (body.attrs.len() * FILE_ATTR_SIZE) as u64;
                let mut buf8 = [0u8; 8];
                LittleEndian::write_u64(&mut buf8, content_size);
                out.extend_from_slice(&buf8);
                for attr in &body.attrs {
                    attr.serialize(out)?;
                }
                Ok(out.len() - start)
            }
        }
    }

    /// Deserializes one block starting at `bytes[0]`. Returns the block
    /// and the number of bytes consumed. A tag byte of zero marks a
    /// hole left by deletion; callers treat this as "no block here".
    pub fn deserialize(
        bytes: &[u8],
        segment_addr: u64,
        global_offset: u64,
        lba_size: usize,
    ) -> Result<Option<(Block, usize)>> {
        if bytes.is_empty() || bytes[0] == 0 {
            return Ok(None);
        }
        let block_type = BlockType::from_tag(bytes[0])?;
        let meta = BlockMeta {
            id: 0,
            segment_addr,
            global_offset,
            loaded: true,
        };
        match block_type {
            BlockType::FileInode | BlockType::DirInode => {
                let is_dir = block_type == BlockType::DirInode;
                let mut off = 1;
                let next = LittleEndian::read_u64(&bytes[off..off + 8]);
                off += 8;
                let prev = LittleEndian::read_u64(&bytes[off..off + 8]);
                off += 8;
                let id = LittleEndian::read_u64(&bytes[off..off + 8]);
                off += 8;
                let name = if is_dir {
                    let len = bytes[off] as usize;
                    off += 1;
                    let s = String::from_utf8_lossy(&bytes[off..off + len]).into_owned();
                    off += MAX_NAME_LENGTH;
                    s
                } else {
                    String::new()
                };
                let mut offsets = Vec::new();
                loop {
                    let v = LittleEndian::read_u64(&bytes[off..off + 8]);
                    off += 8;
                    if v == 0 {
                        break;
                    }
                    offsets.push(v);
                }
                let mut body = InodeBody {
                    meta,
                    next,
                    prev,
                    name,
                    offsets,
                };
                body.meta.id = id;
                let block = if is_dir {
                    Block::DirInode(body)
                } else {
                    Block::FileInode(body)
                };
                Ok(Some((block, lba_size)))
            }
            BlockType::FileData => {
                let content_size = LittleEndian::read_u64(&bytes[1..9]) as usize;
                let content = bytes[9..9 + content_size].to_vec();
                Ok(Some((
                    Block::FileData(DataBody { meta, content }),
                    9 + content_size,
                )))
            }
            BlockType::DirData => {
                let content_size = LittleEndian::read_u64(&bytes[1..9]) as usize;
                let mut attrs = Vec::new();
                let mut off = 9;
                let end = 9 + content_size;
                while off < end {
                    attrs.push(FileAttr::deserialize(&bytes[off..off + FILE_ATTR_SIZE])?);
                    off += FILE_ATTR_SIZE;
                }
                Ok(Some((Block::DirData(DirDataBody { meta, attrs }), end)))
            }
        }
    }

    /// Drops any heap payload, retaining identity/offsets, so the
    /// block can be rehydrated later without losing its place in a chain.
    pub fn offload(&mut self) {
        match self {
            Block::FileData(body) => body.content.clear(),
            Block::DirData(body) => body.attrs.clear(),
            _ => {}
        }
        self.meta_mut().loaded = false;
    }
}
