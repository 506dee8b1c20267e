//! Capture buffers for the primary and diagnostic output channels.

/// Per-channel capture limit (1 MiB).
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Marker appended once a channel hits its limit.
pub const TRUNCATION_MARKER: &str = "\n... output truncated\n";

/// Output channel written by submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// `print`, `io.write`, `io.stdout:write`.
    Primary,
    /// `warn`, `io.stderr:write`.
    Diagnostic,
}

#[derive(Debug, Default)]
struct Buffer {
    text: String,
    truncated: bool,
}

impl Buffer {
    fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let room = MAX_CAPTURE_BYTES.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.text.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }

    fn take(&mut self) -> String {
        self.truncated = false;
        std::mem::take(&mut self.text)
    }
}

/// Output captured during a single engine call.
#[derive(Debug, Default)]
pub struct OutputCapture {
    primary: Buffer,
    diagnostic: Buffer,
}

impl OutputCapture {
    /// Append text to a channel.
    pub fn write(&mut self, channel: Channel, chunk: &str) {
        match channel {
            Channel::Primary => self.primary.push(chunk),
            Channel::Diagnostic => self.diagnostic.push(chunk),
        }
    }

    /// Drain both channels, returning `(primary, diagnostic)`.
    pub fn take(&mut self) -> (String, String) {
        (self.primary.take(), self.diagnostic.take())
    }

    /// Discard anything left over from a previous call.
    pub fn clear(&mut self) {
        let _ = self.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_are_separate() {
        let mut capture = OutputCapture::default();
        capture.write(Channel::Primary, "out\n");
        capture.write(Channel::Diagnostic, "warn\n");
        capture.write(Channel::Primary, "more\n");

        let (primary, diagnostic) = capture.take();
        assert_eq!(primary, "out\nmore\n");
        assert_eq!(diagnostic, "warn\n");
        assert_eq!(capture.take(), (String::new(), String::new()));
    }

    #[test]
    fn test_truncates_at_limit_once() {
        let mut capture = OutputCapture::default();
        let big = "x".repeat(MAX_CAPTURE_BYTES - 2);
        capture.write(Channel::Primary, &big);
        capture.write(Channel::Primary, "ééé");
        capture.write(Channel::Primary, "dropped");

        let (primary, _) = capture.take();
        assert!(primary.ends_with(TRUNCATION_MARKER));
        assert_eq!(primary.matches("truncated").count(), 1);
        assert!(!primary.contains("dropped"));
        // one two-byte char fits in the remaining room
        assert!(primary.starts_with(&big));
        assert_eq!(
            primary.len(),
            MAX_CAPTURE_BYTES + TRUNCATION_MARKER.len()
        );
    }

    #[test]
    fn test_take_resets_truncation() {
        let mut capture = OutputCapture::default();
        capture.write(Channel::Diagnostic, &"y".repeat(MAX_CAPTURE_BYTES + 1));
        capture.clear();
        capture.write(Channel::Diagnostic, "fresh");
        assert_eq!(capture.take().1, "fresh");
    }
}
