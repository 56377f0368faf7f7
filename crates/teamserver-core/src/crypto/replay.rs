//! Sliding-window replay protection for counter nonces (RFC 6479 style).

const WINDOW_BITS: u64 = 2048;
const WORDS: usize = (WINDOW_BITS / 64) as usize;

/// Tracks the highest accepted counter plus a bitmap of the 2048 counters
/// behind it. Frames are normally in order on a WebSocket, but broadcast
/// and handler replies are encrypted from different tasks, so a small
/// amount of reordering between encrypt and send is tolerated.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: [u64; WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: None,
            bitmap: [0; WORDS],
        }
    }

    /// True if `counter` has not been seen and is not behind the window.
    pub fn check(&self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if counter > highest {
            return true;
        }
        let behind = highest - counter;
        if behind >= WINDOW_BITS {
            return false;
        }
        let (word, bit) = ((behind / 64) as usize, behind % 64);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Record `counter` as seen. Call only after the frame authenticated.
    pub fn mark(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
            }
            Some(highest) if counter > highest => {
                self.advance(counter - highest);
                self.highest = Some(counter);
            }
            Some(_) => {}
        }
        let highest = self.highest.unwrap_or(counter);
        let behind = highest - counter;
        if behind < WINDOW_BITS {
            let (word, bit) = ((behind / 64) as usize, behind % 64);
            self.bitmap[word] |= 1u64 << bit;
        }
    }

    /// Slide the window forward by `shift` positions. Bit 0 of word 0 is
    /// always the highest counter.
    fn advance(&mut self, shift: u64) {
        if shift >= WINDOW_BITS {
            self.bitmap = [0; WORDS];
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;

        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            self.bitmap[..word_shift].fill(0);
        }
        if bit_shift > 0 {
            for i in (1..WORDS).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] << bit_shift) | (self.bitmap[i - 1] >> (64 - bit_shift));
            }
            self.bitmap[0] <<= bit_shift;
        }
    }
}
