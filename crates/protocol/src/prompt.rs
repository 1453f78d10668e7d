//! Credential prompt detection over a cumulative text buffer.

/// Lowercase fragments that signal the remote side wants a password.
pub const PROMPT_MARKERS: &[&str] = &["password:", "password for"];

/// Upper bound on retained text; only the tail can still complete a marker.
const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// Accumulates lowercased output and reports when a prompt marker appears.
///
/// Matching runs against everything seen so far, so a marker split across
/// chunks (`"Pass"` then `"word: "`) is still found.
#[derive(Debug, Default, Clone)]
pub struct PromptMatcher {
    buffer: String,
}

impl PromptMatcher {
    /// Creates an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns true if the buffer now holds a marker.
    pub fn feed(&mut self, chunk: &str) -> bool {
        self.buffer.push_str(&chunk.to_lowercase());
        let found = self.matches();
        if !found {
            self.trim();
        }
        found
    }

    /// Returns true if any marker is present in the buffer.
    pub fn matches(&self) -> bool {
        PROMPT_MARKERS.iter().any(|m| self.buffer.contains(m))
    }

    /// Text accumulated so far, lowercased.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    fn trim(&mut self) {
        if self.buffer.len() <= MAX_BUFFER_BYTES {
            return;
        }
        let mut cut = self.buffer.len() - MAX_BUFFER_BYTES;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}
