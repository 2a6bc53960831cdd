use std::cell::UnsafeCell;

/// Per-connection scratch allocator.
///
/// Hands out slices copied into chunk storage; `reset` ends every loan (it
/// takes `&mut self`) and keeps at most `retain` bytes of capacity so the
/// fast path stays allocation-free across requests without growing forever.
///
/// Chunks never reallocate once created: allocations that do not fit the
/// spare capacity of the last chunk open a new chunk, so previously returned
/// slices stay valid until `reset`.
pub struct Arena {
    chunks: UnsafeCell<Vec<Vec<u8>>>,
    retain: usize,
}

impl Arena {
    pub fn new(retain: usize) -> Self {
        Arena {
            chunks: UnsafeCell::new(Vec::new()),
            retain,
        }
    }

    /// Copy `data` into the arena and return the stored slice.
    pub fn alloc_bytes(&self, data: &[u8]) -> &[u8] {
        if data.is_empty() {
            return &[];
        }
        let chunk = self.chunk_with_spare(data.len());
        let start = chunk.len();
        chunk.extend_from_slice(data);
        // The chunk's heap buffer is stable: extend never exceeds the
        // capacity fixed at creation, and reset requires &mut self.
        unsafe { std::slice::from_raw_parts(chunk.as_ptr().add(start), data.len()) }
    }

    /// Copy `s` into the arena and return the stored string.
    pub fn alloc_str(&self, s: &str) -> &str {
        let bytes = self.alloc_bytes(s.as_bytes());
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Drop all loans and shrink to at most `retain` bytes of capacity.
    pub fn reset(&mut self) {
        let chunks = self.chunks.get_mut();
        match chunks.first() {
            Some(first) if first.capacity() <= self.retain => {
                chunks.truncate(1);
                chunks[0].clear();
            }
            _ => chunks.clear(),
        }
    }

    /// Total capacity currently held.
    pub fn capacity(&self) -> usize {
        let chunks = unsafe { &*self.chunks.get() };
        chunks.iter().map(|c| c.capacity()).sum()
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> usize {
        let chunks = unsafe { &*self.chunks.get() };
        chunks.iter().map(|c| c.len()).sum()
    }

    fn chunk_with_spare(&self, need: usize) -> &mut Vec<u8> {
        let chunks = unsafe { &mut *self.chunks.get() };
        let fits = chunks
            .last()
            .map(|c| c.capacity() - c.len() >= need)
            .unwrap_or(false);
        if !fits {
            let grown = chunks.last().map(|c| c.capacity() * 2).unwrap_or(0);
            let cap = need.max(self.retain.max(64)).max(grown);
            chunks.push(Vec::with_capacity(cap));
        }
        chunks.last_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let arena = Arena::new(1024);
        let a = arena.alloc_bytes(b"hello");
        let b = arena.alloc_str("world");
        assert_eq!(a, b"hello");
        assert_eq!(b, "world");
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn loans_survive_growth() {
        let arena = Arena::new(64);
        let first = arena.alloc_bytes(b"0123456789");
        // Force several new chunks.
        for _ in 0..100 {
            arena.alloc_bytes(&[0xAB; 96]);
        }
        assert_eq!(first, b"0123456789");
    }

    #[test]
    fn reset_retains_bounded_capacity() {
        let retain = 256;
        let mut arena = Arena::new(retain);
        for _ in 0..50 {
            arena.alloc_bytes(&[0u8; 128]);
        }
        assert!(arena.capacity() > retain);
        arena.reset();
        assert!(arena.capacity() <= retain);
        assert_eq!(arena.used(), 0);

        // Still usable after reset.
        assert_eq!(arena.alloc_bytes(b"again"), b"again");
    }

    #[test]
    fn empty_alloc() {
        let arena = Arena::new(16);
        assert_eq!(arena.alloc_bytes(b""), b"");
        assert_eq!(arena.capacity(), 0);
    }
}
