//! Sliding-window replay protection for transport nonces
//!
//! One window per receive direction. Nonces at or below the window floor, or
//! already marked in the bitmap, are replays. A nonce further ahead of the
//! highest accepted one than the window size indicates an unrecoverable gap
//! and kills the session.

use crate::errors::NoiseError;

/// Anti-replay window over 64-bit message nonces
#[derive(Debug)]
pub struct ReplayWindow {
    /// Window size in nonces
    size: u64,
    /// Ring bitmap, one bit per in-window nonce
    bitmap: Vec<u64>,
    /// Highest accepted nonce
    highest: u64,
    /// False until the first nonce is accepted
    primed: bool,
}

impl ReplayWindow {
    /// Create a window of `size` nonces (rounded up to a multiple of 64)
    pub fn new(size: u64) -> Self {
        let words = size.div_ceil(64).max(1) as usize;
        Self {
            size: words as u64 * 64,
            bitmap: vec![0u64; words],
            highest: 0,
            primed: false,
        }
    }

    /// Validate a nonce without mutating the window
    pub fn check(&self, nonce: u64) -> Result<(), NoiseError> {
        if !self.primed {
            return Ok(());
        }
        if nonce > self.highest {
            if nonce - self.highest > self.size {
                return Err(NoiseError::NonceGapExceeded { nonce });
            }
            return Ok(());
        }
        if self.highest - nonce >= self.size {
            return Err(NoiseError::ReplayDetected { nonce });
        }
        if self.is_marked(nonce) {
            return Err(NoiseError::ReplayDetected { nonce });
        }
        Ok(())
    }

    /// Mark a nonce as seen after its message authenticated
    ///
    /// Callers must `check` first; committing an unauthenticated nonce would
    /// let an attacker burn future sequence numbers.
    pub fn commit(&mut self, nonce: u64) {
        if !self.primed {
            self.primed = true;
            self.highest = nonce;
            self.clear_all();
            self.mark(nonce);
            return;
        }
        if nonce > self.highest {
            let advance = nonce - self.highest;
            if advance >= self.size {
                self.clear_all();
            } else {
                for stale in (self.highest + 1)..=nonce {
                    self.clear(stale);
                }
            }
            self.highest = nonce;
        }
        self.mark(nonce);
    }

    /// Highest accepted nonce, if any
    pub fn highest(&self) -> Option<u64> {
        self.primed.then_some(self.highest)
    }

    fn word_and_bit(&self, nonce: u64) -> (usize, u64) {
        let slot = nonce % self.size;
        ((slot / 64) as usize, slot % 64)
    }

    fn is_marked(&self, nonce: u64) -> bool {
        let (word, bit) = self.word_and_bit(nonce);
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn mark(&mut self, nonce: u64) {
        let (word, bit) = self.word_and_bit(nonce);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn clear(&mut self, nonce: u64) {
        let (word, bit) = self.word_and_bit(nonce);
        self.bitmap[word] &= !(1u64 << bit);
    }

    fn clear_all(&mut self) {
        self.bitmap.fill(0);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
