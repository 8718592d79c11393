use bytes::Bytes;

/// Splits a byte stream into transport-sized messages without copying
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// The smaller of the configured size and what the transport accepts
    pub fn for_transport(configured: usize, transport_limit: usize) -> Self {
        Self::new(configured.min(transport_limit))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn split(&self, bytes: Bytes) -> Chunks {
        Chunks {
            rest: bytes,
            chunk_size: self.chunk_size,
        }
    }
}

/// Consecutive slices of one buffer, in order
#[derive(Debug)]
pub struct Chunks {
    rest: Bytes,
    chunk_size: usize,
}

impl Iterator for Chunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.rest.is_empty() {
            return None;
        }
        let take = self.chunk_size.min(self.rest.len());
        Some(self.rest.split_to(take))
    }
}
