//! Scatter-gather write chain.
//!
//! At most three fragments (header block, chunk line, payload). A partial
//! `writev` trims whole fragments off the front and advances into the
//! first partially written one.

use std::collections::VecDeque;
use std::io::IoSlice;

struct Fragment {
    data: Vec<u8>,
    pos: usize,
}

impl Fragment {
    fn rest(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

#[derive(Default)]
pub struct WriteChain {
    frags: VecDeque<Fragment>,
}

impl WriteChain {
    pub const MAX_FRAGMENTS: usize = 3;

    pub fn new() -> Self {
        WriteChain {
            frags: VecDeque::with_capacity(Self::MAX_FRAGMENTS),
        }
    }

    /// Append a fragment. Empty fragments are skipped. `false` when the
    /// chain is full.
    pub fn push(&mut self, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        if self.frags.len() == Self::MAX_FRAGMENTS {
            return false;
        }
        self.frags.push_back(Fragment { data, pos: 0 });
        true
    }

    /// Fragments still (partly) unwritten.
    pub fn len(&self) -> usize {
        self.frags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.frags.iter().map(|f| f.data.len() - f.pos).sum()
    }

    pub fn slices(&self) -> Vec<IoSlice<'_>> {
        self.frags.iter().map(|f| IoSlice::new(f.rest())).collect()
    }

    /// First unwritten bytes; TLS writes one fragment at a time.
    pub fn first(&self) -> Option<&[u8]> {
        self.frags.front().map(|f| f.rest())
    }

    /// Account for `n` written bytes.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.frags.front_mut() else {
                return;
            };
            let left = front.data.len() - front.pos;
            if n < left {
                front.pos += n;
                return;
            }
            n -= left;
            self.frags.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.frags.clear();
    }
}
