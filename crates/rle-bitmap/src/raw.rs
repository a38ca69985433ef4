//! Conversion to and from the on-disk bitmap form.
//!
//! On disk, index `i` is bit `i % 8` of byte `i / 8`. Bytes past the end of
//! the supplied buffer read as free.

use core::ops::Range;

use super::RleBitmap;

impl RleBitmap {
    /// Decodes a bitmap of `capacity` indices from its on-disk bytes.
    #[must_use]
    pub fn from_raw(capacity: usize, bytes: &[u8]) -> Self {
        let mut bitmap = Self::new(capacity);
        let limit = usize::min(capacity, bytes.len() * 8);
        let mut run_start = None;
        let mut bit = 0;
        while bit < limit {
            if bit % 8 == 0 && bit + 8 <= limit {
                match (bytes[bit / 8], run_start) {
                    (0x00, None) | (0xff, Some(_)) => {
                        bit += 8;
                        continue;
                    }
                    _ => {}
                }
            }
            let set = bytes[bit / 8] & (1 << (bit % 8)) != 0;
            match (set, run_start) {
                (true, None) => run_start = Some(bit),
                (false, Some(start)) => {
                    bitmap.push_run(start..bit);
                    run_start = None;
                }
                _ => {}
            }
            bit += 1;
        }
        if let Some(start) = run_start {
            bitmap.push_run(start..limit);
        }
        bitmap
    }

    /// Encodes the indices `[first, first + out.len() * 8)` into `out`.
    ///
    /// Indices past the capacity are written as free.
    pub fn write_raw(&self, first: usize, out: &mut [u8]) {
        out.fill(0);
        let window = first..first + out.len() * 8;
        for run in &self.runs {
            if run.end <= window.start {
                continue;
            }
            if run.start >= window.end {
                break;
            }
            let lo = usize::max(run.start, window.start) - first;
            let hi = usize::min(run.end, window.end) - first;
            fill_bits(out, lo..hi);
        }
    }
}

fn fill_bits(out: &mut [u8], bits: Range<usize>) {
    let mut bit = bits.start;
    while bit < bits.end {
        if bit % 8 == 0 && bit + 8 <= bits.end {
            out[bit / 8] = 0xff;
            bit += 8;
        } else {
            out[bit / 8] |= 1 << (bit % 8);
            bit += 1;
        }
    }
}
