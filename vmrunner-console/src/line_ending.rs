//! Host-to-guest line-ending normalization.
//!
//! Host terminals send CR (raw console) or CRLF for Enter; the guest tty
//! expects LF. A bare CR becomes LF, CRLF collapses to a single LF, every
//! other byte passes through.

/// Streaming normalizer. Remembers a trailing CR so a CRLF split across two
/// reads still yields one LF.
#[derive(Debug, Default, Clone)]
pub struct LineEndingNormalizer {
    prev_cr: bool,
}

impl LineEndingNormalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the normalized form of `input` to `out`.
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &b in input {
            match b {
                b'\r' => {
                    out.push(b'\n');
                    self.prev_cr = true;
                }
                b'\n' if self.prev_cr => self.prev_cr = false,
                _ => {
                    self.prev_cr = false;
                    out.push(b);
                }
            }
        }
    }
}

/// Normalize a complete buffer.
#[must_use]
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    LineEndingNormalizer::new().push(input, &mut out);
    out
}
