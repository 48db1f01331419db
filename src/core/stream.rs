//! Buffered replay stream for live block output.
//!
//! When a run is started with streaming enabled, selected blocks forward
//! their output chunks through a [`StreamWriter`] as they arrive. Chunks are
//! retained in order, so a [`StreamReader`] attached after the run finished
//! still observes the complete sequence; a reader attached early blocks on
//! [`StreamReader::next`] until more data or the end marker arrives.
//! Intended for a single consumer at a time.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

/// One chunk of streamed output, tagged with the producing block.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub block_id: String,
    pub content: String,
}

/// Event observed by a stream reader.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(OutputChunk),
    End,
    Error(String),
}

#[derive(Debug, Default)]
struct StreamState {
    chunks: Vec<OutputChunk>,
    ended: bool,
    error: Option<String>,
}

/// Read half of the run-level output stream.
#[derive(Debug, Clone)]
pub struct OutputStream {
    state: Arc<RwLock<StreamState>>,
    notify: Arc<Notify>,
}

/// Write half of the run-level output stream.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    state: Arc<RwLock<StreamState>>,
    notify: Arc<Notify>,
}

/// Create a connected stream/writer pair.
pub fn channel() -> (OutputStream, StreamWriter) {
    let state = Arc::new(RwLock::new(StreamState::default()));
    let notify = Arc::new(Notify::new());
    (
        OutputStream {
            state: state.clone(),
            notify: notify.clone(),
        },
        StreamWriter { state, notify },
    )
}

impl StreamWriter {
    pub fn write(&self, block_id: &str, content: impl Into<String>) {
        {
            let mut state = self.state.write();
            if state.ended {
                return;
            }
            state.chunks.push(OutputChunk {
                block_id: block_id.to_string(),
                content: content.into(),
            });
        }
        self.notify.notify_one();
    }

    /// Mark the stream complete. Further writes are ignored.
    pub fn end(&self) {
        {
            let mut state = self.state.write();
            state.ended = true;
        }
        self.notify.notify_one();
    }

    pub fn error(&self, message: impl Into<String>) {
        {
            let mut state = self.state.write();
            state.error = Some(message.into());
            state.ended = true;
        }
        self.notify.notify_one();
    }
}

impl OutputStream {
    pub fn reader(&self) -> StreamReader {
        StreamReader {
            state: self.state.clone(),
            notify: self.notify.clone(),
            cursor: 0,
            terminated: false,
        }
    }

    /// Number of chunks buffered so far.
    pub fn len(&self) -> usize {
        self.state.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().chunks.is_empty()
    }

    pub fn is_ended(&self) -> bool {
        self.state.read().ended
    }
}

/// Cursor over the buffered chunk sequence.
#[derive(Debug)]
pub struct StreamReader {
    state: Arc<RwLock<StreamState>>,
    notify: Arc<Notify>,
    cursor: usize,
    terminated: bool,
}

impl StreamReader {
    /// Next event, waiting for the writer when caught up. Returns `None`
    /// once `End` or `Error` has been delivered.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if self.terminated {
                return None;
            }
            {
                let state = self.state.read();
                if self.cursor < state.chunks.len() {
                    let chunk = state.chunks[self.cursor].clone();
                    self.cursor += 1;
                    return Some(StreamEvent::Chunk(chunk));
                }
                if let Some(err) = &state.error {
                    self.terminated = true;
                    return Some(StreamEvent::Error(err.clone()));
                }
                if state.ended {
                    self.terminated = true;
                    return Some(StreamEvent::End);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drain the stream and concatenate all chunk contents.
    pub async fn collect_content(mut self) -> String {
        let mut out = String::new();
        while let Some(event) = self.next().await {
            if let StreamEvent::Chunk(chunk) = event {
                out.push_str(&chunk.content);
            }
        }
        out
    }
}
