//! Persistent bump arena over shared or file-mapped memory.
//!
//! The arena carves typed, fixed-lifetime blocks out of one contiguous
//! region. Blocks are never freed; a block changes hands by flipping its
//! type tag, and readers discover blocks by walking an iteration list
//! kept inside the region itself. Because all bookkeeping lives in the
//! region, a second process that maps the same file sees the same
//! arena and can enumerate it without any cooperation from the owner.
//!
//! Allocation is a lock-free compare-and-swap bump of a cursor; the
//! region never shrinks and never moves, so references (byte offsets)
//! stay valid for the life of the mapping.

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::error::ArenaError;

/// Opaque handle to an arena block: the byte offset of its block header.
/// Zero is never a valid reference.
pub type Reference = u32;

const ARENA_MAGIC: u64 = 0x466C_7452_6563_4131; // "FltRecA1"

/// Bytes the arena reserves for its own header at offset zero.
pub const ARENA_HEADER_SIZE: u32 = 64;

/// Bytes of bookkeeping in front of every block payload.
pub const BLOCK_HEADER_SIZE: u32 = 16;

const ARENA_NAME_LEN: usize = 32;

/// Control block at the start of the region.
#[repr(C)]
struct ArenaHeader {
    magic: u64,
    id: u64,
    size: u32,
    cursor: AtomicU32,
    first_iterable: AtomicU32,
    _reserved: u32,
    name: [u8; ARENA_NAME_LEN],
}

/// Bookkeeping in front of every allocated block.
#[repr(C)]
struct BlockHeader {
    size: u32,
    type_tag: AtomicU32,
    next_iterable: AtomicU32,
    _reserved: u32,
}

enum Backing {
    /// Process-local zeroed memory; invisible to other processes.
    Heap(*mut [u64]),
    /// Shared file mapping.
    Mapped(MmapMut),
    /// No usable memory at all; every allocation fails.
    Empty,
}

/// A persistent allocator over one contiguous memory region.
///
/// Blocks live forever; only their type tag and contents change. The
/// arena is safe to share between threads, and between processes when
/// file-backed.
pub struct PersistentArena {
    backing: Backing,
    base: *mut u8,
    size: u32,
    id: u64,
    name: String,
}

// SAFETY: all shared bookkeeping (cursor, type tags, iteration list) is
// accessed through atomics; block payloads are handed out as raw pointers
// whose aliasing discipline is the caller's contract.
unsafe impl Send for PersistentArena {}
unsafe impl Sync for PersistentArena {}

const fn round_up8(value: u32) -> Option<u32> {
    match value.checked_add(7) {
        Some(v) => Some(v & !7),
        None => None,
    }
}

impl PersistentArena {
    /// Creates an arena over zeroed process-local memory.
    ///
    /// A size too small to hold the arena header yields a valid but
    /// permanently exhausted arena, which callers handle through their
    /// normal allocation-failure path.
    #[must_use]
    pub fn new_local(size: usize, id: u64, name: &str) -> Self {
        if size < ARENA_HEADER_SIZE as usize || size > u32::MAX as usize {
            return Self {
                backing: Backing::Empty,
                base: ptr::null_mut(),
                size: 0,
                id,
                name: name.to_owned(),
            };
        }
        // Word-sized allocation keeps the region 8-byte aligned.
        let words = vec![0u64; size.div_ceil(8)].into_boxed_slice();
        let raw = Box::into_raw(words);
        let base = raw.cast::<u8>();
        let mut arena = Self {
            backing: Backing::Heap(raw),
            base,
            size: size as u32,
            id,
            name: name.to_owned(),
        };
        // Fresh zeroed memory; initialization cannot fail.
        let _ = arena.init_or_adopt();
        arena
    }

    /// Creates an arena over a file mapping, truncating any previous
    /// contents. The file is extended to `size` and zero-filled by the
    /// filesystem.
    pub fn with_file(path: &Path, size: usize, id: u64, name: &str) -> Result<Self, ArenaError> {
        if size < ARENA_HEADER_SIZE as usize || size > u32::MAX as usize {
            return Err(ArenaError::TooLarge { size });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        // SAFETY: the mapping is kept alive by the returned arena and the
        // file length was just set to cover it.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let mut arena = Self {
            backing: Backing::Mapped(map),
            base,
            size: size as u32,
            id,
            name: name.to_owned(),
        };
        arena.init_or_adopt()?;
        Ok(arena)
    }

    /// Maps an existing arena file, adopting its header. This is the
    /// entry point for an analyzer examining another process's data.
    pub fn open_file(path: &Path) -> Result<Self, ArenaError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < u64::from(ARENA_HEADER_SIZE) || len > u64::from(u32::MAX) {
            return Err(ArenaError::Corrupt);
        }
        // SAFETY: as above; the mapping outlives every pointer we derive.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let mut arena = Self {
            backing: Backing::Mapped(map),
            base,
            size: len as u32,
            id: 0,
            name: String::new(),
        };
        // A zeroed or foreign file is not an arena; never initialize one
        // on behalf of the process being examined.
        unsafe {
            let magic = ptr::addr_of!((*base.cast::<ArenaHeader>()).magic).read_volatile();
            if magic != ARENA_MAGIC {
                return Err(ArenaError::Corrupt);
            }
        }
        arena.init_or_adopt()?;
        Ok(arena)
    }

    fn init_or_adopt(&mut self) -> Result<(), ArenaError> {
        if self.base.is_null() || self.size < ARENA_HEADER_SIZE {
            return Ok(()); // Empty arena; nothing to initialize.
        }
        let header_ptr = self.base.cast::<ArenaHeader>();
        // SAFETY: the region covers ArenaHeader, is 8-byte aligned, and
        // is private to this call until the arena is shared.
        unsafe {
            let magic = ptr::addr_of!((*header_ptr).magic).read_volatile();
            if magic == 0 {
                ptr::addr_of_mut!((*header_ptr).id).write(self.id);
                ptr::addr_of_mut!((*header_ptr).size).write(self.size);
                let mut name = [0u8; ARENA_NAME_LEN];
                let bytes = self.name.as_bytes();
                let len = bytes.len().min(ARENA_NAME_LEN - 1);
                name[..len].copy_from_slice(&bytes[..len]);
                ptr::addr_of_mut!((*header_ptr).name).write(name);
                (*header_ptr).cursor.store(ARENA_HEADER_SIZE, Ordering::Relaxed);
                (*header_ptr).first_iterable.store(0, Ordering::Relaxed);
                ptr::addr_of_mut!((*header_ptr).magic).write_volatile(ARENA_MAGIC);
            } else if magic == ARENA_MAGIC {
                let recorded = ptr::addr_of!((*header_ptr).size).read();
                let cursor = (*header_ptr).cursor.load(Ordering::Acquire);
                if recorded > self.size || cursor < ARENA_HEADER_SIZE || cursor > recorded {
                    return Err(ArenaError::Corrupt);
                }
                self.size = recorded;
                self.id = ptr::addr_of!((*header_ptr).id).read();
                let name = ptr::addr_of!((*header_ptr).name).read();
                let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                self.name = String::from_utf8_lossy(&name[..end]).into_owned();
            } else {
                return Err(ArenaError::Corrupt);
            }
        }
        Ok(())
    }

    #[inline]
    fn header(&self) -> Option<&ArenaHeader> {
        if self.base.is_null() || self.size < ARENA_HEADER_SIZE {
            return None;
        }
        // SAFETY: the region is 8-byte aligned, outlives `self`, and is
        // at least ARENA_HEADER_SIZE bytes; shared mutation goes through
        // the header's atomic fields only.
        Some(unsafe { &*self.base.cast::<ArenaHeader>() })
    }

    fn block(&self, reference: Reference) -> Option<&BlockHeader> {
        self.header()?;
        let end = reference.checked_add(BLOCK_HEADER_SIZE)?;
        if reference < ARENA_HEADER_SIZE || reference % 8 != 0 || end > self.size {
            return None;
        }
        // SAFETY: bounds and alignment checked above.
        Some(unsafe { &*self.base.add(reference as usize).cast::<BlockHeader>() })
    }

    /// Allocates a zeroed block of at least `size` bytes with the given
    /// non-zero type tag. Returns `None` when the arena is exhausted.
    pub fn allocate(&self, size: u32, type_tag: u32) -> Option<Reference> {
        debug_assert_ne!(type_tag, 0, "type tag zero is reserved for unallocated space");
        let header = self.header()?;
        let total = BLOCK_HEADER_SIZE.checked_add(round_up8(size)?)?;

        let mut cursor = header.cursor.load(Ordering::Acquire);
        loop {
            let end = cursor.checked_add(total)?;
            if end > self.size {
                return None;
            }
            match header
                .cursor
                .compare_exchange_weak(cursor, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => cursor = actual,
            }
        }

        // SAFETY: the cursor CAS gave this thread exclusive ownership of
        // [cursor, cursor + total); the memory has never been allocated
        // before and is therefore zero.
        unsafe {
            let block = self.base.add(cursor as usize).cast::<BlockHeader>();
            ptr::addr_of_mut!((*block).size).write(size);
            (*block).next_iterable.store(0, Ordering::Relaxed);
            // Publishing the tag releases the size field for readers.
            (*block).type_tag.store(type_tag, Ordering::Release);
        }
        Some(cursor)
    }

    /// Resolves a reference to its payload, checking the type tag first.
    /// An `expected_type` of zero matches any tag.
    pub fn get_block(&self, reference: Reference, expected_type: u32) -> Option<NonNull<u8>> {
        let block = self.block(reference)?;
        let tag = block.type_tag.load(Ordering::Acquire);
        if tag == 0 || (expected_type != 0 && tag != expected_type) {
            return None;
        }
        let payload = reference + BLOCK_HEADER_SIZE;
        let size = round_up8(block.size)?;
        if payload.checked_add(size)? > self.size {
            return None;
        }
        // SAFETY: payload offset validated against the region bounds.
        NonNull::new(unsafe { self.base.add(payload as usize) })
    }

    /// Returns the usable payload size recorded for a block.
    pub fn alloc_size(&self, reference: Reference) -> Option<u32> {
        let block = self.block(reference)?;
        if block.type_tag.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(block.size)
    }

    /// Atomically swings a block's type tag from `from` to `to`.
    pub fn change_type(&self, reference: Reference, to: u32, from: u32) -> bool {
        debug_assert_ne!(to, 0);
        let Some(block) = self.block(reference) else {
            return false;
        };
        block
            .type_tag
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publishes a block onto the iteration list so that any reader of
    /// the region, in this process or another, will find it. A block is
    /// made iterable at most once; it stays on the list forever.
    pub fn make_iterable(&self, reference: Reference) {
        let (Some(header), Some(block)) = (self.header(), self.block(reference)) else {
            debug_assert!(false, "make_iterable on an invalid reference");
            return;
        };
        // Lock-free push; the list ends up newest-first, which no reader
        // depends on.
        let mut head = header.first_iterable.load(Ordering::Acquire);
        loop {
            debug_assert_ne!(head, reference, "block made iterable twice");
            block.next_iterable.store(head, Ordering::Relaxed);
            match header.first_iterable.compare_exchange_weak(
                head,
                reference,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Iterates over every iterable block as `(reference, type_tag)`.
    /// Tags are read at visit time; a block recycled mid-iteration shows
    /// its new tag.
    #[must_use]
    pub fn iter(&self) -> BlockIter<'_> {
        let next = self
            .header()
            .map_or(0, |h| h.first_iterable.load(Ordering::Acquire));
        BlockIter { arena: self, next }
    }

    /// The caller-assigned arena id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The caller-assigned arena name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total region size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size as usize
    }
}

impl Drop for PersistentArena {
    fn drop(&mut self) {
        if let Backing::Heap(raw) = self.backing {
            // SAFETY: produced by Box::into_raw in new_local and never
            // freed elsewhere.
            unsafe { drop(Box::from_raw(raw)) };
        }
    }
}

impl std::fmt::Debug for PersistentArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentArena")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Iterator over the arena's iterable blocks.
pub struct BlockIter<'a> {
    arena: &'a PersistentArena,
    next: Reference,
}

impl Iterator for BlockIter<'_> {
    type Item = (Reference, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let reference = self.next;
        let block = self.arena.block(reference)?;
        self.next = block.next_iterable.load(Ordering::Relaxed);
        let tag = block.type_tag.load(Ordering::Acquire);
        Some((reference, tag))
    }
}
