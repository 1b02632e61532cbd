//! Window assignment for windowed aggregation.
//!
//! A [`WindowSpec`] describes hopping windows of a fixed size advancing by
//! a fixed interval; tumbling windows are the special case where the
//! advance equals the size. A record with timestamp `t` belongs to every
//! window with `start <= t < start + size`.

use std::time::Duration;

use smallvec::SmallVec;

/// Window starts a single timestamp can map to. Hopping configurations
/// rarely overlap more than a handful of windows.
pub type WindowStarts = SmallVec<[i64; 4]>;

/// Size and advance of a hopping window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Window length.
    size_ms: i64,
    /// Distance between consecutive window starts. `size_ms` for tumbling.
    advance_ms: i64,
}

impl WindowSpec {
    /// Creates non-overlapping windows of the given size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn tumbling(size: Duration) -> Self {
        Self::hopping(size, size)
    }

    /// Creates overlapping windows of `size` advancing by `advance`.
    ///
    /// # Panics
    ///
    /// Panics if either duration is zero or `advance > size`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn hopping(size: Duration, advance: Duration) -> Self {
        let size_ms = size.as_millis() as i64;
        let advance_ms = advance.as_millis() as i64;
        assert!(size_ms > 0, "window size must be non-zero");
        assert!(advance_ms > 0, "window advance must be non-zero");
        assert!(advance_ms <= size_ms, "window advance must not exceed size");
        Self { size_ms, advance_ms }
    }

    /// Returns the window size in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Returns the advance interval in milliseconds.
    #[must_use]
    pub fn advance_ms(&self) -> i64 {
        self.advance_ms
    }

    /// End (exclusive) of the window starting at `start`.
    #[must_use]
    pub fn window_end(&self, start: i64) -> i64 {
        start + self.size_ms
    }

    /// Returns the starts of all windows containing `timestamp`, ascending.
    ///
    /// Window starts are aligned to multiples of the advance interval.
    /// Negative timestamps floor correctly.
    #[must_use]
    pub fn windows_for(&self, timestamp: i64) -> WindowStarts {
        let mut starts = WindowStarts::new();

        // Latest aligned start at or before the timestamp.
        let latest = floor_div(timestamp, self.advance_ms) * self.advance_ms;

        let mut start = latest;
        while start > timestamp - self.size_ms {
            starts.push(start);
            start -= self.advance_ms;
        }
        starts.reverse();
        starts
    }
}

/// Floor division for window alignment (rounds toward negative infinity).
#[inline]
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Encodes a windowed store key: `key ++ 0x00 ++ window_start (i64 BE)`.
///
/// Big-endian start keeps a key's windows adjacent and time-ordered under
/// the store's lexicographic range scans; the zero separator keeps one
/// key's windows from interleaving with a longer key's.
#[must_use]
pub fn window_key(key: &[u8], window_start: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 9);
    out.extend_from_slice(key);
    out.push(0);
    out.extend_from_slice(&window_start.to_be_bytes());
    out
}

/// Decodes a windowed store key produced by [`window_key`].
///
/// Returns `None` if the input is too short or the separator is missing.
#[must_use]
pub fn decode_window_key(encoded: &[u8]) -> Option<(&[u8], i64)> {
    if encoded.len() < 9 {
        return None;
    }
    let (head, ts_bytes) = encoded.split_at(encoded.len() - 8);
    let (key, sep) = head.split_at(head.len() - 1);
    if sep != [0] {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(ts_bytes);
    Some((key, i64::from_be_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tumbling_assigns_single_window() {
        let spec = WindowSpec::tumbling(Duration::from_millis(60_000));
        let starts = spec.windows_for(61_000);
        assert_eq!(starts.as_slice(), &[60_000]);
        assert_eq!(spec.window_end(60_000), 120_000);
    }

    #[test]
    fn test_tumbling_boundary_belongs_to_new_window() {
        let spec = WindowSpec::tumbling(Duration::from_millis(1000));
        assert_eq!(spec.windows_for(999).as_slice(), &[0]);
        assert_eq!(spec.windows_for(1000).as_slice(), &[1000]);
    }

    #[test]
    fn test_hopping_assigns_overlapping_windows() {
        // size 10s, advance 5s: t=12s falls in [5s,15s) and [10s,20s)
        let spec = WindowSpec::hopping(Duration::from_secs(10), Duration::from_secs(5));
        let starts = spec.windows_for(12_000);
        assert_eq!(starts.as_slice(), &[5_000, 10_000]);
    }

    #[test]
    fn test_negative_timestamp_floors() {
        let spec = WindowSpec::tumbling(Duration::from_millis(1000));
        assert_eq!(spec.windows_for(-1).as_slice(), &[-1000]);
        assert_eq!(spec.windows_for(-1000).as_slice(), &[-1000]);
    }

    #[test]
    fn test_window_key_roundtrip() {
        let encoded = window_key(b"alice", 60_000);
        let (key, start) = decode_window_key(&encoded).unwrap();
        assert_eq!(key, b"alice");
        assert_eq!(start, 60_000);
    }

    #[test]
    fn test_window_key_orders_by_time_within_key() {
        let a = window_key(b"alice", 0);
        let b = window_key(b"alice", 60_000);
        assert!(a < b);
    }

    #[test]
    fn test_window_keys_do_not_interleave_across_keys() {
        // "a"'s windows sort strictly before "ab"'s regardless of start.
        let a_late = window_key(b"a", i64::MAX);
        let ab_early = window_key(b"ab", i64::MIN);
        assert!(a_late < ab_early);
    }

    #[test]
    fn test_decode_rejects_short_or_malformed() {
        assert!(decode_window_key(b"short").is_none());
        let mut bad = window_key(b"k", 5);
        bad[1] = 1; // clobber the separator
        assert!(decode_window_key(&bad).is_none());
    }
}
