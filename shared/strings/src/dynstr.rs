use std::fmt;

/// Growable string accumulator with a byte limit and a sticky error latch.
///
/// Once a write would push the content past the limit, the write is truncated
/// at a character boundary and the latch is set; every later write is a
/// no-op. Consumers compose freely and call [`DynStr::error`] once before
/// using the result.
#[derive(Debug)]
pub struct DynStr {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl DynStr {
    /// Accumulator bounded to `limit` bytes of content.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Unbounded accumulator (still latches if a writer asks it to).
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Remaining capacity in bytes.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    /// Whether any write has been truncated since the last reset.
    pub fn error(&self) -> bool {
        self.truncated
    }

    /// Force the latch; later writes become no-ops.
    pub fn set_error(&mut self) {
        self.truncated = true;
    }

    /// Append as much of `s` as fits. Partial fits truncate at a char
    /// boundary and latch the error flag.
    pub fn append(&mut self, s: &str) {
        if self.truncated || s.is_empty() {
            return;
        }
        let room = self.limit - self.buf.len();
        if s.len() <= room {
            self.buf.push_str(s);
            return;
        }
        let mut cut = room;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf.push_str(&s[..cut]);
        self.truncated = true;
    }

    /// Clear content and the latch, keeping the limit.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.truncated = false;
    }

    /// Take the accumulated string and reset the accumulator.
    pub fn steal(&mut self) -> String {
        self.truncated = false;
        std::mem::take(&mut self.buf)
    }
}

impl Default for DynStr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for DynStr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Truncation latches instead of erroring so `write!` chains never
        // need per-call handling.
        self.append(s);
        Ok(())
    }
}

impl fmt::Display for DynStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn exact_fit_succeeds_without_latch() {
        let mut ds = DynStr::with_limit(7);
        ds.append("call");
        ds.append("ing");
        assert_eq!(ds.as_str(), "calling");
        assert!(!ds.error());
    }

    #[test]
    fn one_byte_short_truncates_and_latches() {
        let mut ds = DynStr::with_limit(6);
        ds.append("calling");
        assert_eq!(ds.as_str(), "callin");
        assert!(ds.error());

        // Latched: further writes are no-ops.
        ds.append("x");
        assert_eq!(ds.as_str(), "callin");
    }

    #[test]
    fn write_macro_composes() {
        let mut ds = DynStr::with_limit(32);
        write!(ds, "exten {} prio {}", "s", 1).unwrap();
        assert_eq!(ds.as_str(), "exten s prio 1");
        assert!(!ds.error());
    }

    #[test]
    fn truncation_respects_char_boundary() {
        let mut ds = DynStr::with_limit(5);
        ds.append("ab\u{00e9}cd"); // é is two bytes, boundary falls inside 'c'? limit 5: "ab" + 2-byte é = 4, then 'c' fits -> 5
        assert_eq!(ds.as_str(), "ab\u{00e9}c");
        assert!(ds.error());

        let mut ds = DynStr::with_limit(3);
        ds.append("ab\u{00e9}");
        // é does not fit in the single remaining byte.
        assert_eq!(ds.as_str(), "ab");
        assert!(ds.error());
    }

    #[test]
    fn steal_resets() {
        let mut ds = DynStr::with_limit(4);
        ds.append("abcdef");
        assert!(ds.error());
        let s = ds.steal();
        assert_eq!(s, "abcd");
        assert!(!ds.error());
        assert!(ds.is_empty());
        ds.append("ok");
        assert_eq!(ds.as_str(), "ok");
    }
}
