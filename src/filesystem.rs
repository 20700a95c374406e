//! The log-structured filesystem: path resolution, directory/file
//! inode-chain operations, segment lifecycle management, and the
//! storage-engine-facing API (an `Env`-shaped surface: sequential and
//! random-access reads, append-only writable files, directory
//! creation/listing, rename, delete, and advisory file locking).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{Block, FileAttr};
use crate::error::{Error, Result};
use crate::ftl::Ftl;
use crate::segment::Segment;
use crate::threadpool::ThreadPool;

/// Fixed inode id of the filesystem root directory.
const ROOT_INODE_ID: u64 = 1;

/// Worker count for the background segment-flush pool. Flushing is
/// lightweight (one LBA append per dirty segment at a time) and mostly
/// I/O-bound, so a small fixed pool is enough to keep up with the
/// foreground write rate without contending heavily for segment locks.
const FLUSH_POOL_SIZE: usize = 2;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Caches loaded [`Segment`]s, indexed by segment index, loading from
/// the FTL on first access.
struct SegmentCache {
    ftl: Ftl,
    segment_bytes: u64,
    lba_size: u32,
    segments: RwLock<HashMap<u32, Arc<RwLock<Segment>>>>,
}

impl SegmentCache {
    fn new(ftl: Ftl, segment_bytes: u64, lba_size: u32) -> Self {
        Self {
            ftl,
            segment_bytes,
            lba_size,
            segments: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, index: u32) -> Result<Arc<RwLock<Segment>>> {
        if let Some(seg) = self.segments.read().unwrap().get(&index) {
            return Ok(seg.clone());
        }
        // A zone the FTL has never mapped (fresh device, or a data
        // zone not yet handed to any virtual zone) reads back as
        // NotFound; treat that as an empty, not-yet-materialized segment.
        let segment = match Segment::load(&self.ftl, index, self.segment_bytes, self.lba_size) {
            Ok(segment) => segment,
            Err(Error::NotFound) => {
                Segment::new_empty(index, self.segment_bytes, self.lba_size)
            }
            Err(e) => return Err(e),
        };
        let handle = Arc::new(RwLock::new(segment));
        self.segments
            .write()
            .unwrap()
            .insert(index, handle.clone());
        Ok(handle)
    }

    fn insert_fresh(&self, index: u32) -> Result<Arc<RwLock<Segment>>> {
        let segment = Segment::new_empty(index, self.segment_bytes, self.lba_size);
        let handle = Arc::new(RwLock::new(segment));
        self.segments
            .write()
            .unwrap()
            .insert(index, handle.clone());
        Ok(handle)
    }

    fn segment_of(&self, global_offset: u64) -> Result<Arc<RwLock<Segment>>> {
        let index = (global_offset / self.segment_bytes) as u32;
        self.get(index)
    }
}

/// Which referrer field pointed at a block, so a compaction pass can
/// patch it once the block has been relocated.
#[derive(Debug, Clone)]
enum RefSite {
    Root,
    InodeNext(u64),
    InodePrev(u64),
    InodeOffsetSlot { inode_offset: u64, slot: usize },
    DirAttrSlot { block_offset: u64, attr_index: usize },
}

pub struct Filesystem {
    inner: Arc<FsInner>,
}

struct FsInner {
    ftl: Ftl,
    segment_bytes: u64,
    total_segments: u32,
    segments: SegmentCache,
    next_inode_id: AtomicU64,
    root_offset: RwLock<u64>,
    write_segment: Mutex<u32>,
    free_segments: Mutex<VecDeque<u32>>,
    locks: Mutex<HashSet<String>>,
    flusher: ThreadPool,
}

impl Clone for Filesystem {
    fn clone(&self) -> Self {
        Filesystem {
            inner: self.inner.clone(),
        }
    }
}

impl Filesystem {
    /// Mounts the filesystem over an already-initialized FTL, creating
    /// a fresh root directory if segment 0 has never been written.
    pub fn mount(ftl: Ftl) -> Result<Self> {
        let geometry = ftl.geometry();
        let segment_bytes = geometry.zone_bytes();
        let total_segments = (ftl.capacity_bytes() / segment_bytes) as u32;
        if total_segments == 0 {
            return Err(Error::InvalidArgument(
                "device too small to hold a single segment".into(),
            ));
        }
        let segments = SegmentCache::new(ftl.clone(), segment_bytes, geometry.lba_size);

        let seg0 = segments.get(0)?;
        let mut free_segments = VecDeque::new();
        let (next_id, root_offset) = {
            let mut seg0 = seg0.write().unwrap();
            match seg0.id_counter() {
                Some(0) => {
                    let root_offset = seg0.allocate_new(ROOT_INODE_ID, true, "/".to_string())?;
                    seg0.set_id_counter(ROOT_INODE_ID + 1)?;
                    seg0.flush(&ftl, false)?;
                    (ROOT_INODE_ID + 1, root_offset)
                }
                Some(counter) => {
                    // The root directory is always the first inode
                    // allocated into segment 0, i.e. right after its
                    // reserved header/inode-map region, not at
                    // `addr_start` itself (which holds only that
                    // header). Recovering it from the inode map by
                    // `ROOT_INODE_ID` is robust to that layout detail.
                    let root_offset = *seg0
                        .inode_map()
                        .get(&ROOT_INODE_ID)
                        .ok_or(Error::Corruption { tag: 0 })?;
                    (counter, root_offset)
                }
                None => unreachable!("segment 0 always carries an id counter"),
            }
        };

        for idx in 1..total_segments {
            let seg = segments.get(idx)?;
            if seg.read().unwrap().is_empty_of_live_blocks() {
                free_segments.push_back(idx);
            }
        }

        let write_segment = free_segments.pop_front().unwrap_or(0);
        if !segments_contains(&segments, write_segment) {
            segments.insert_fresh(write_segment)?;
        }

        Ok(Filesystem {
            inner: Arc::new(FsInner {
                ftl,
                segment_bytes,
                total_segments,
                segments,
                next_inode_id: AtomicU64::new(next_id),
                root_offset: RwLock::new(root_offset),
                write_segment: Mutex::new(write_segment),
                free_segments: Mutex::new(free_segments),
                locks: Mutex::new(HashSet::new()),
                flusher: ThreadPool::new(FLUSH_POOL_SIZE),
            }),
        })
    }

    fn alloc_id(&self) -> u64 {
        self.inner.next_inode_id.fetch_add(1, Ordering::SeqCst)
    }

    fn root_offset(&self) -> u64 {
        *self.inner.root_offset.read().unwrap()
    }

    fn segment(&self, global_offset: u64) -> Result<Arc<RwLock<Segment>>> {
        self.inner.segments.segment_of(global_offset)
    }

    fn rotate_write_segment(&self) -> Result<u32> {
        let mut free = self.inner.free_segments.lock().unwrap();
        let next = match free.pop_front() {
            Some(idx) => idx,
            None => return Err(Error::NoSpace),
        };
        self.inner.segments.insert_fresh(next)?;
        *self.inner.write_segment.lock().unwrap() = next;
        Ok(next)
    }

    /// Allocates a new inode block, rotating to a fresh segment first
    /// if the current write segment has no room for it.
    fn allocate_inode(&self, id: u64, is_dir: bool, name: String) -> Result<u64> {
        loop {
            let idx = *self.inner.write_segment.lock().unwrap();
            let seg = self.inner.segments.get(idx)?;
            let mut seg = seg.write().unwrap();
            match seg.allocate_new(id, is_dir, name.clone()) {
                Ok(offset) => {
                    drop(seg);
                    self.schedule_background_flush(idx);
                    return Ok(offset);
                }
                Err(Error::NoSpace) => {
                    drop(seg);
                    self.rotate_write_segment()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Allocates a data block (FILE_DATA/DIR_DATA) holding as much of
    /// `payload` as fits in the current write segment, rotating if the
    /// current one is entirely full. Returns the offset and the number
    /// of bytes actually consumed.
    fn allocate_data_chunk(&self, id: u64, payload: &[u8], is_dir: bool) -> Result<(u64, usize)> {
        loop {
            let idx = *self.inner.write_segment.lock().unwrap();
            let seg = self.inner.segments.get(idx)?;
            let mut seg = seg.write().unwrap();
            let budget = seg.data_budget() as usize;
            if budget == 0 {
                drop(seg);
                self.rotate_write_segment()?;
                continue;
            }
            let take = payload.len().min(budget);
            let offset = seg.allocate_data(id, &payload[..take], is_dir)?;
            drop(seg);
            self.schedule_background_flush(idx);
            return Ok((offset, take));
        }
    }

    fn with_block<T>(&self, offset: u64, f: impl FnOnce(&mut Block) -> Result<T>) -> Result<T> {
        let seg = self.segment(offset)?;
        let mut locked = seg.write().unwrap();
        let block = locked.block_mut(offset)?;
        let result = f(block)?;
        locked.rewrite(offset)?;
        drop(locked);
        self.schedule_background_flush((offset / self.inner.segment_bytes) as u32);
        Ok(result)
    }

    /// Submits a best-effort background flush of segment `index` to the
    /// flush pool, so a caller that never calls `sync`/`close` still
    /// gets its writes pushed to the device in the background instead
    /// of only ever living in the resident segment cache.
    fn schedule_background_flush(&self, index: u32) {
        if let Ok(seg) = self.inner.segments.get(index) {
            let ftl = self.inner.ftl.clone();
            self.inner.flusher.submit(move || {
                if let Err(err) = seg.write().unwrap().flush(&ftl, true) {
                    log::error!("background flush of segment {index} failed: {err}");
                }
            });
        }
    }

    fn read_block_clone(&self, offset: u64) -> Result<Block> {
        let seg = self.segment(offset)?;
        let mut seg = seg.write().unwrap();
        Ok(seg.block(offset)?.clone())
    }

    /// Appends a data-block offset to the tail inode of the chain
    /// rooted at `head_offset`, splicing in a new continuation inode if
    /// the tail is full.
    fn link_data_block(&self, head_offset: u64, data_offset: u64, id: u64, is_dir: bool) -> Result<()> {
        let mut tail_offset = self.tail_of_chain(head_offset)?;
        loop {
            let lba_size = self.inner.ftl.geometry().lba_size as usize;
            let full = self.with_block(tail_offset, |block| {
                let inode = block.as_inode_mut().ok_or(Error::Corruption { tag: 0 })?;
                let max = Block::max_offsets(lba_size, is_dir);
                if inode.offsets.len() >= max {
                    Ok(true)
                } else {
                    inode.offsets.push(data_offset);
                    Ok(false)
                }
            })?;
            if !full {
                return Ok(());
            }
            let new_tail = self.allocate_inode(id, is_dir, String::new())?;
            self.with_block(tail_offset, |block| {
                block.as_inode_mut().unwrap().next = new_tail;
                Ok(())
            })?;
            self.with_block(new_tail, |block| {
                block.as_inode_mut().unwrap().prev = tail_offset;
                Ok(())
            })?;
            tail_offset = new_tail;
        }
    }

    fn tail_of_chain(&self, head_offset: u64) -> Result<u64> {
        let mut current = head_offset;
        loop {
            let next = self.read_block_clone(current)?
                .as_inode()
                .ok_or(Error::Corruption { tag: 0 })?
                .next;
            if next == 0 {
                return Ok(current);
            }
            current = next;
        }
    }

    /// Concatenates the owned data-block offsets across an inode chain.
    fn chain_data_offsets(&self, head_offset: u64) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut current = head_offset;
        loop {
            let inode = self.read_block_clone(current)?;
            let inode = inode.as_inode().ok_or(Error::Corruption { tag: 0 })?;
            out.extend(inode.offsets.iter().copied());
            if inode.next == 0 {
                break;
            }
            current = inode.next;
        }
        Ok(out)
    }

    /// Appends `fa` as a new entry in the directory rooted at
    /// `dir_head`. Each call allocates a fresh one-entry DIR_DATA block
    /// rather than growing an existing one: blocks are bump-allocated
    /// in segment order, so widening a block written earlier would
    /// overwrite whatever was allocated right after it.
    fn directory_append(&self, dir_head: u64, fa: FileAttr) -> Result<()> {
        let id = self.alloc_id();
        let mut payload = Vec::new();
        fa.serialize(&mut payload)?;
        let (data_offset, taken) = self.allocate_data_chunk(id, &payload, true)?;
        if taken != payload.len() {
            return Err(Error::NoSpace);
        }
        self.link_data_block(dir_head, data_offset, id, true)
    }

    /// Finds `name` among the directory rooted at `dir_head`. Returns
    /// the matching attr plus the DIR_DATA block offset and slot index
    /// it lives in, so callers can patch or remove it in place.
    fn directory_lookup(&self, dir_head: u64, name: &str) -> Result<Option<(FileAttr, u64, usize)>> {
        for data_offset in self.chain_data_offsets(dir_head)? {
            let block = self.read_block_clone(data_offset)?;
            let dir_data = block.as_dir_data().ok_or(Error::Corruption { tag: 0 })?;
            for (idx, attr) in dir_data.attrs.iter().enumerate() {
                if attr.name == name {
                    return Ok(Some((attr.clone(), data_offset, idx)));
                }
            }
        }
        Ok(None)
    }

    fn read_children(&self, dir_head: u64) -> Result<Vec<FileAttr>> {
        let mut out = Vec::new();
        for data_offset in self.chain_data_offsets(dir_head)? {
            let block = self.read_block_clone(data_offset)?;
            let dir_data = block.as_dir_data().ok_or(Error::Corruption { tag: 0 })?;
            out.extend(dir_data.attrs.iter().cloned());
        }
        Ok(out)
    }

    fn replace_child_attr(&self, block_offset: u64, index: usize, fa: FileAttr) -> Result<()> {
        self.with_block(block_offset, |block| {
            let dir_data = block.as_dir_data_mut().ok_or(Error::Corruption { tag: 0 })?;
            dir_data.attrs[index] = fa;
            Ok(())
        })
    }

    fn remove_child_attr(&self, block_offset: u64, index: usize) -> Result<()> {
        self.with_block(block_offset, |block| {
            let dir_data = block.as_dir_data_mut().ok_or(Error::Corruption { tag: 0 })?;
            dir_data.attrs.remove(index);
            Ok(())
        })
    }

    fn split_path(path: &str) -> Vec<&str> {
        path.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Resolves `path` to its defining attr (if not root) and the
    /// global offset of the inode it names.
    fn resolve(&self, path: &str) -> Result<(Option<FileAttr>, u64)> {
        let parts = Self::split_path(path);
        let mut current = self.root_offset();
        let mut attr = None;
        for part in parts {
            let (fa, _block, _idx) = self
                .directory_lookup(current, part)?
                .ok_or(Error::NotFound)?;
            current = fa.offset;
            attr = Some(fa);
        }
        Ok((attr, current))
    }

    fn resolve_parent<'a>(&self, path: &'a str) -> Result<(u64, &'a str)> {
        let parts = Self::split_path(path);
        let (leaf, parent_parts) = parts.split_last().ok_or(Error::InvalidArgument(
            "path must name an entry, not the root".into(),
        ))?;
        let mut current = self.root_offset();
        for part in parent_parts {
            let (fa, _, _) = self.directory_lookup(current, part)?.ok_or(Error::NotFound)?;
            current = fa.offset;
        }
        Ok((current, leaf))
    }

    // ---- External API ----

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        let (parent_offset, leaf) = self.resolve_parent(path)?;
        FileAttr::validate_name(leaf)?;
        if self.directory_lookup(parent_offset, leaf)?.is_some() {
            return Err(Error::InvalidArgument(format!("{path} already exists")));
        }
        let id = self.alloc_id();
        let offset = self.allocate_inode(id, true, leaf.to_string())?;
        self.directory_append(
            parent_offset,
            FileAttr {
                name: leaf.to_string(),
                size: 0,
                is_dir: true,
                create_time: now_secs(),
                offset,
                inode_id: id,
            },
        )
    }

    pub fn create_dir_if_missing(&self, path: &str) -> Result<()> {
        match self.resolve(path) {
            Ok(_) => Ok(()),
            Err(Error::NotFound) => self.create_dir(path),
            Err(e) => Err(e),
        }
    }

    pub fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let (_, dir_offset) = self.resolve(path)?;
        Ok(self.read_children(dir_offset)?.into_iter().map(|a| a.name).collect())
    }

    fn create_file(&self, path: &str) -> Result<u64> {
        let (parent_offset, leaf) = self.resolve_parent(path)?;
        FileAttr::validate_name(leaf)?;
        if let Some((old, block_offset, idx)) = self.directory_lookup(parent_offset, leaf)? {
            if old.is_dir {
                return Err(Error::InvalidArgument(format!("{path} is a directory")));
            }
            let id = self.alloc_id();
            let offset = self.allocate_inode(id, false, String::new())?;
            self.replace_child_attr(
                block_offset,
                idx,
                FileAttr {
                    name: leaf.to_string(),
                    size: 0,
                    is_dir: false,
                    create_time: now_secs(),
                    offset,
                    inode_id: id,
                },
            )?;
            return Ok(offset);
        }
        let id = self.alloc_id();
        let offset = self.allocate_inode(id, false, String::new())?;
        self.directory_append(
            parent_offset,
            FileAttr {
                name: leaf.to_string(),
                size: 0,
                is_dir: false,
                create_time: now_secs(),
                offset,
                inode_id: id,
            },
        )?;
        Ok(offset)
    }

    /// Opens `path` for append, creating it (and a length-0 file) if
    /// it doesn't already exist.
    pub fn open_writable(&self, path: &str, append: bool) -> Result<WritableFile> {
        let offset = if append {
            match self.resolve(path)? {
                (Some(attr), offset) if !attr.is_dir => offset,
                (Some(_), _) => return Err(Error::InvalidArgument(format!("{path} is a directory"))),
                (None, offset) => offset,
            }
        } else {
            self.create_file(path)?
        };
        Ok(WritableFile {
            fs: self.clone(),
            path: path.to_string(),
            head_offset: offset,
        })
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (attr, head_offset) = self.resolve(path)?;
        if attr.as_ref().map(|a| a.is_dir).unwrap_or(true) {
            return Err(Error::InvalidArgument(format!("{path} is a directory")));
        }
        let mut out = Vec::new();
        for data_offset in self.chain_data_offsets(head_offset)? {
            let block = self.read_block_clone(data_offset)?;
            out.extend_from_slice(&block.as_file_data().ok_or(Error::Corruption { tag: 0 })?.content);
        }
        Ok(out)
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let (old_parent, old_leaf) = self.resolve_parent(old_path)?;
        let (fa, block_offset, idx) = self
            .directory_lookup(old_parent, old_leaf)?
            .ok_or(Error::NotFound)?;
        let (new_parent, new_leaf) = self.resolve_parent(new_path)?;
        if self.directory_lookup(new_parent, new_leaf)?.is_some() {
            return Err(Error::InvalidArgument(format!("{new_path} already exists")));
        }
        self.remove_child_attr(block_offset, idx)?;
        let mut renamed = fa;
        renamed.name = new_leaf.to_string();
        self.directory_append(new_parent, renamed)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        let (parent_offset, leaf) = self.resolve_parent(path)?;
        let (_, block_offset, idx) = self
            .directory_lookup(parent_offset, leaf)?
            .ok_or(Error::NotFound)?;
        self.remove_child_attr(block_offset, idx)
    }

    /// Advisory lock keyed by path; a second lock on the same path fails.
    pub fn lock(&self, path: &str) -> Result<()> {
        let mut locks = self.inner.locks.lock().unwrap();
        if !locks.insert(path.to_string()) {
            return Err(Error::InvalidArgument(format!("{path} already locked")));
        }
        Ok(())
    }

    pub fn unlock(&self, path: &str) -> Result<()> {
        let mut locks = self.inner.locks.lock().unwrap();
        if !locks.remove(path) {
            return Err(Error::InvalidArgument(format!("{path} is not locked")));
        }
        Ok(())
    }

    pub fn absolute_path(&self, path: &str) -> String {
        let parts = Self::split_path(path);
        format!("/{}", parts.join("/"))
    }

    // ---- Segment-level garbage collection ----

    /// Walks the directory tree from the root, returning the set of
    /// live block offsets and, for each, the referrer site(s) that
    /// point to it (so a compaction pass can patch them after a move).
    fn live_graph(&self) -> Result<(HashSet<u64>, HashMap<u64, Vec<RefSite>>)> {
        let mut live = HashSet::new();
        let mut referrers: HashMap<u64, Vec<RefSite>> = HashMap::new();
        let root = self.root_offset();
        live.insert(root);
        referrers.entry(root).or_default().push(RefSite::Root);
        self.walk_inode_chain(root, true, &mut live, &mut referrers)?;
        Ok((live, referrers))
    }

    fn walk_inode_chain(
        &self,
        head: u64,
        is_dir: bool,
        live: &mut HashSet<u64>,
        referrers: &mut HashMap<u64, Vec<RefSite>>,
    ) -> Result<()> {
        let mut current = head;
        loop {
            let block = self.read_block_clone(current)?;
            let inode = block.as_inode().ok_or(Error::Corruption { tag: 0 })?;
            for (slot, &data_offset) in inode.offsets.iter().enumerate() {
                live.insert(data_offset);
                referrers
                    .entry(data_offset)
                    .or_default()
                    .push(RefSite::InodeOffsetSlot {
                        inode_offset: current,
                        slot,
                    });
                if is_dir {
                    let data_block = self.read_block_clone(data_offset)?;
                    let dir_data = data_block.as_dir_data().ok_or(Error::Corruption { tag: 0 })?;
                    for (attr_index, attr) in dir_data.attrs.iter().enumerate() {
                        live.insert(attr.offset);
                        referrers
                            .entry(attr.offset)
                            .or_default()
                            .push(RefSite::DirAttrSlot {
                                block_offset: data_offset,
                                attr_index,
                            });
                        if attr.is_dir {
                            self.walk_inode_chain(attr.offset, true, live, referrers)?;
                        } else {
                            self.walk_inode_chain(attr.offset, false, live, referrers)?;
                        }
                    }
                }
            }
            if inode.next != 0 {
                live.insert(inode.next);
                referrers
                    .entry(inode.next)
                    .or_default()
                    .push(RefSite::InodeNext(current));
                referrers
                    .entry(current)
                    .or_default()
                    .push(RefSite::InodePrev(inode.next));
                current = inode.next;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Compacts segment `index`: relocates every still-live block it
    /// holds into the current write segment, patches every referrer of
    /// those blocks, and resets the segment for reuse. Analogous to
    /// the FTL's zone-level GC, but operating on filesystem inode/data
    /// blocks instead of raw LBAs.
    pub fn run_segment_gc(&self, index: u32) -> Result<()> {
        if index == *self.inner.write_segment.lock().unwrap() {
            return Err(Error::InvalidArgument(
                "cannot compact the active write segment".into(),
            ));
        }
        let (live, referrers) = self.live_graph()?;
        let seg_start = index as u64 * self.inner.segment_bytes;
        let seg_end = seg_start + self.inner.segment_bytes;

        let live_in_segment: Vec<u64> = live
            .iter()
            .copied()
            .filter(|&o| o >= seg_start && o < seg_end)
            .collect();
        if live_in_segment.is_empty() {
            self.reclaim_segment(index)?;
            return Ok(());
        }

        let mut relocations = HashMap::new();
        for old_offset in live_in_segment {
            let block = self.read_block_clone(old_offset)?;
            let new_offset = self.relocate_block(&block)?;
            relocations.insert(old_offset, new_offset);
        }

        for (&old_offset, &new_offset) in &relocations {
            if let Some(sites) = referrers.get(&old_offset) {
                for site in sites {
                    self.patch_referrer(site, new_offset)?;
                }
            }
        }

        self.reclaim_segment(index)
    }

    fn relocate_block(&self, block: &Block) -> Result<u64> {
        match block {
            Block::FileInode(body) | Block::DirInode(body) => {
                let is_dir = matches!(block, Block::DirInode(_));
                let new_offset = self.allocate_inode(body.meta.id, is_dir, body.name.clone())?;
                self.with_block(new_offset, |b| {
                    let inode = b.as_inode_mut().unwrap();
                    inode.next = body.next;
                    inode.prev = body.prev;
                    inode.offsets = body.offsets.clone();
                    Ok(())
                })?;
                Ok(new_offset)
            }
            Block::FileData(body) => {
                let (offset, taken) =
                    self.allocate_data_chunk(body.meta.id, &body.content, false)?;
                if taken != body.content.len() {
                    return Err(Error::NoSpace);
                }
                Ok(offset)
            }
            Block::DirData(body) => {
                let mut payload = Vec::new();
                for attr in &body.attrs {
                    attr.serialize(&mut payload)?;
                }
                let (offset, taken) = self.allocate_data_chunk(body.meta.id, &payload, true)?;
                if taken != payload.len() {
                    return Err(Error::NoSpace);
                }
                Ok(offset)
            }
        }
    }

    fn patch_referrer(&self, site: &RefSite, new_offset: u64) -> Result<()> {
        match site {
            RefSite::Root => {
                *self.inner.root_offset.write().unwrap() = new_offset;
                Ok(())
            }
            RefSite::InodeNext(at) => self.with_block(*at, |b| {
                b.as_inode_mut().unwrap().next = new_offset;
                Ok(())
            }),
            RefSite::InodePrev(at) => self.with_block(*at, |b| {
                b.as_inode_mut().unwrap().prev = new_offset;
                Ok(())
            }),
            RefSite::InodeOffsetSlot { inode_offset, slot } => self.with_block(*inode_offset, |b| {
                b.as_inode_mut().unwrap().offsets[*slot] = new_offset;
                Ok(())
            }),
            RefSite::DirAttrSlot {
                block_offset,
                attr_index,
            } => self.with_block(*block_offset, |b| {
                b.as_dir_data_mut().unwrap().attrs[*attr_index].offset = new_offset;
                Ok(())
            }),
        }
    }

    fn reclaim_segment(&self, index: u32) -> Result<()> {
        let seg = self.inner.segments.insert_fresh(index)?;
        seg.write().unwrap().flush(&self.inner.ftl, false)?;
        self.inner.free_segments.lock().unwrap().push_back(index);
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        let segments = self.inner.segments.segments.read().unwrap();
        for seg in segments.values() {
            seg.write().unwrap().flush(&self.inner.ftl, false)?;
        }
        Ok(())
    }

    pub fn total_segments(&self) -> u32 {
        self.inner.total_segments
    }

    pub fn ftl(&self) -> &Ftl {
        &self.inner.ftl
    }
}

fn segments_contains(cache: &SegmentCache, index: u32) -> bool {
    cache.segments.read().unwrap().contains_key(&index)
}

/// A handle for sequential appends to a file, mirroring
/// `rocksdb::WritableFile`.
pub struct WritableFile {
    fs: Filesystem,
    path: String,
    head_offset: u64,
}

impl WritableFile {
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let id = self.fs.alloc_id();
            let (offset, taken) = self.fs.allocate_data_chunk(id, remaining, false)?;
            self.fs.link_data_block(self.head_offset, offset, id, false)?;
            remaining = &remaining[taken..];
        }
        self.bump_size(data.len() as u64)
    }

    fn bump_size(&self, delta: u64) -> Result<()> {
        let (parent_offset, leaf) = self.fs.resolve_parent(&self.path)?;
        if let Some((mut attr, block_offset, idx)) = self.fs.directory_lookup(parent_offset, leaf)? {
            attr.size += delta;
            self.fs.replace_child_attr(block_offset, idx, attr)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.fs.flush_all()
    }

    pub fn close(self) -> Result<()> {
        self.sync()
    }
}

/// A sequential reader, mirroring `rocksdb::SequentialFile`.
pub struct SequentialReader {
    content: Vec<u8>,
    position: usize,
}

impl SequentialReader {
    pub fn open(fs: &Filesystem, path: &str) -> Result<Self> {
        Ok(Self {
            content: fs.read_file(path)?,
            position: 0,
        })
    }

    pub fn read(&mut self, n: usize) -> &[u8] {
        let end = (self.position + n).min(self.content.len());
        let slice = &self.content[self.position..end];
        self.position = end;
        slice
    }

    pub fn skip(&mut self, n: usize) {
        self.position = (self.position + n).min(self.content.len());
    }
}

/// A random-access reader, mirroring `rocksdb::RandomAccessFile`.
pub struct RandomAccessReader {
    content: Vec<u8>,
}

impl RandomAccessReader {
    pub fn open(fs: &Filesystem, path: &str) -> Result<Self> {
        Ok(Self {
            content: fs.read_file(path)?,
        })
    }

    pub fn read_at(&self, offset: usize, n: usize) -> &[u8] {
        if offset >= self.content.len() {
            return &[];
        }
        let end = (offset + n).min(self.content.len());
        &self.content[offset..end]
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}
