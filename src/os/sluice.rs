/// Marker appended to surfaced text when the buffer refused bytes
pub const TRUNCATION_MARKER: &str = "\n[diagnostics truncated]";

/// A fixed-size buffer for a worker's diagnostic stream.
///
/// Once full, the buffer keeps its prefix and counts what it refused, so a
/// noisy worker can never grow it past `capacity` while the loss stays visible.
#[derive(Debug, Clone)]
pub struct Sluice {
    buffer: Vec<u8>,
    capacity: usize,
    dropped: u64,
}

impl Sluice {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append as much of `data` as fits.
    /// Returns true if anything had to be dropped by this call.
    pub fn append(&mut self, data: &[u8]) -> bool {
        let available = self.capacity.saturating_sub(self.buffer.len());
        let take = data.len().min(available);
        self.buffer.extend_from_slice(&data[..take]);
        let refused = data.len() - take;
        self.dropped += refused as u64;
        refused > 0
    }

    /// Number of bytes refused since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Contents as UTF-8 (lossy), with the truncation marker if bytes were refused
    pub fn as_string(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.buffer).to_string();
        if self.dropped > 0 {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_within_capacity() {
        let mut sluice = Sluice::new(16);
        assert!(!sluice.append(b"bad row 3"));
        assert_eq!(sluice.as_string(), "bad row 3");
        assert_eq!(sluice.dropped(), 0);
    }

    #[test]
    fn test_overflow_keeps_prefix_and_marks() {
        let mut sluice = Sluice::new(8);
        assert!(!sluice.append(b"12345"));
        assert!(sluice.append(b"6789abc"));
        assert!(sluice.append(b"more"));
        assert_eq!(sluice.dropped(), 8);
        assert_eq!(sluice.as_string(), format!("12345678{}", TRUNCATION_MARKER));
    }
}
