use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Flush once the buffer holds at least this many bytes.
pub const MAX_BUFFERED_BYTES: usize = 256;
/// Flush once this much time has passed since the previous flush.
pub const MAX_BUFFER_AGE: Duration = Duration::from_millis(200);

/// Batches streamed `agent_message_chunk` fragments per session so the
/// upstream sees well-sized updates instead of a torrent of tiny ones.
///
/// Bytes are preserved verbatim and in insertion order; a batch is emitted
/// when a fragment contains a newline, the buffer reaches
/// [`MAX_BUFFERED_BYTES`], or [`MAX_BUFFER_AGE`] has elapsed since the last
/// flush.
#[derive(Debug, Default)]
pub struct ChunkCoalescer {
    by_session: Mutex<HashMap<String, ChunkState>>,
}

#[derive(Debug)]
struct ChunkState {
    buf: String,
    last_flush: Instant,
}

impl ChunkCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns the buffered batch when a flush trigger
    /// fires, `None` while the fragment is still being buffered.
    pub fn append(&self, session_id: &str, text: &str) -> Option<String> {
        let mut by_session = self.by_session.lock();
        let state = by_session
            .entry(session_id.to_string())
            .or_insert_with(|| ChunkState {
                buf: String::new(),
                last_flush: Instant::now(),
            });
        state.buf.push_str(text);

        let now = Instant::now();
        if text.contains('\n')
            || state.buf.len() >= MAX_BUFFERED_BYTES
            || now.duration_since(state.last_flush) >= MAX_BUFFER_AGE
        {
            state.last_flush = now;
            return Some(std::mem::take(&mut state.buf));
        }
        None
    }

    /// Drain whatever is buffered for a session, if anything.
    pub fn flush(&self, session_id: &str) -> Option<String> {
        let mut by_session = self.by_session.lock();
        let state = by_session.get_mut(session_id)?;
        if state.buf.is_empty() {
            return None;
        }
        state.last_flush = Instant::now();
        Some(std::mem::take(&mut state.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkCoalescer, MAX_BUFFERED_BYTES};

    #[test]
    fn small_fragments_are_buffered() {
        let coalescer = ChunkCoalescer::new();
        assert_eq!(coalescer.append("sess-1", "a"), None);
        assert_eq!(coalescer.append("sess-1", "b"), None);
        assert_eq!(coalescer.flush("sess-1").as_deref(), Some("ab"));
    }

    #[test]
    fn newline_triggers_a_flush() {
        let coalescer = ChunkCoalescer::new();
        assert_eq!(coalescer.append("sess-1", "hello "), None);
        assert_eq!(
            coalescer.append("sess-1", "world\n").as_deref(),
            Some("hello world\n")
        );
        assert_eq!(coalescer.flush("sess-1"), None);
    }

    #[test]
    fn size_threshold_triggers_a_flush() {
        let coalescer = ChunkCoalescer::new();
        let fragment = "x".repeat(MAX_BUFFERED_BYTES);
        let batch = coalescer.append("sess-1", &fragment).unwrap();
        assert_eq!(batch.len(), MAX_BUFFERED_BYTES);
    }

    #[test]
    fn age_threshold_triggers_a_flush() {
        let coalescer = ChunkCoalescer::new();
        assert_eq!(coalescer.append("sess-1", "early"), None);
        std::thread::sleep(std::time::Duration::from_millis(250));
        assert_eq!(
            coalescer.append("sess-1", " late").as_deref(),
            Some("early late")
        );
    }

    #[test]
    fn sessions_do_not_share_buffers() {
        let coalescer = ChunkCoalescer::new();
        assert_eq!(coalescer.append("sess-1", "one"), None);
        assert_eq!(coalescer.append("sess-2", "two"), None);
        assert_eq!(coalescer.flush("sess-1").as_deref(), Some("one"));
        assert_eq!(coalescer.flush("sess-2").as_deref(), Some("two"));
    }

    #[test]
    fn flush_of_unknown_or_empty_session_is_none() {
        let coalescer = ChunkCoalescer::new();
        assert_eq!(coalescer.flush("sess-1"), None);
        coalescer.append("sess-1", "text\n");
        assert_eq!(coalescer.flush("sess-1"), None);
    }

    #[test]
    fn bytes_are_preserved_across_batches() {
        let coalescer = ChunkCoalescer::new();
        let fragments = ["fn main() {", " println!(\"hi\");\n", "}", ""];
        let mut emitted = String::new();
        for fragment in fragments {
            if let Some(batch) = coalescer.append("sess-1", fragment) {
                emitted.push_str(&batch);
            }
        }
        if let Some(batch) = coalescer.flush("sess-1") {
            emitted.push_str(&batch);
        }
        assert_eq!(emitted, fragments.concat());
    }
}
