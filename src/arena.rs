// Bump arena for cached scanline rows
//
// The line caches insert thousands of short painted rows per second; giving
// each its own heap allocation would dominate the evaluation loop. Rows are
// bump-allocated into large chunks instead and referenced by handle, so the
// whole arena can be released in one step when a worker's cache budget is
// exceeded.
//
// Handles are plain indices, never pointers. After `clear` every previously
// issued handle is logically dead; the owning evaluator drops all cache
// nodes holding handles before clearing, which keeps a dangling `RowRef`
// unrepresentable in practice and a panic (out-of-bounds index) at worst.

/// Chunk size in bytes. Large enough that a chunk allocation is rare.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Handle to a byte run inside an [`Arena`]. Valid until the next
/// [`Arena::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    chunk: u32,
    start: u32,
    len: u32,
}

/// Bump allocator with O(1) allocation and O(1) mass reset.
pub struct Arena {
    chunks: Vec<Vec<u8>>,
    total: usize,
}

impl Arena {
    pub fn new() -> Arena {
        Arena {
            chunks: Vec::new(),
            total: 0,
        }
    }

    /// Copy `bytes` into the arena and return a handle to the copy.
    pub fn alloc(&mut self, bytes: &[u8]) -> RowRef {
        // 8-byte alignment keeps runs from straddling cache lines oddly and
        // matches the chunk accounting granularity.
        let need = (bytes.len() + 7) & !7;

        let fits = self
            .chunks
            .last()
            .map(|c| c.capacity() - c.len() >= need)
            .unwrap_or(false);
        if !fits {
            let cap = CHUNK_SIZE.max(need);
            self.chunks.push(Vec::with_capacity(cap));
            self.total += cap;
        }

        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let start = chunk.len();
        chunk.extend_from_slice(bytes);
        // Pad to the alignment boundary
        chunk.resize(start + need, 0);

        RowRef {
            chunk: chunk_idx as u32,
            start: start as u32,
            len: bytes.len() as u32,
        }
    }

    /// Resolve a handle to the stored bytes.
    ///
    /// # Panics
    ///
    /// Panics if the handle predates the last [`Arena::clear`]; that is a
    /// bug in the caller's invalidation pass.
    #[inline]
    pub fn row(&self, r: RowRef) -> &[u8] {
        let chunk = &self.chunks[r.chunk as usize];
        &chunk[r.start as usize..(r.start + r.len) as usize]
    }

    /// Release every chunk. All outstanding handles become invalid.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }

    /// Total reserved bytes (chunk capacities, not just bytes in use).
    #[inline]
    pub fn size(&self) -> usize {
        self.total
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
