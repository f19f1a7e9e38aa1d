use crate::utils::output_normalizer::{incomplete_escape_start, normalize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    /// Holding a partial line that flushes at `deadline` unless more data arrives.
    Accumulating { deadline: Instant },
}

/// Coalesces streamed output into display lines.
///
/// `Idle -> Accumulating -> (newline | timeout) -> flush -> Idle`. The buffer
/// owns no timer: the caller passes the current instant in and sleeps until
/// [`OutputBuffer::deadline`] itself, so it works under any scheduler.
#[derive(Debug)]
pub struct OutputBuffer {
    pending: String,
    state: BufferState,
    idle: Duration,
}

impl OutputBuffer {
    pub fn new(idle: Duration) -> Self {
        Self {
            pending: String::new(),
            state: BufferState::Idle,
            idle,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            BufferState::Accumulating { deadline } => Some(deadline),
            BufferState::Idle => None,
        }
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Appends decoded text and returns every line completed by it.
    ///
    /// Text after the last line break stays buffered and (re)arms the idle deadline.
    pub fn push(&mut self, text: &str, now: Instant) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        self.pending.push_str(text);

        let complete_len = complete_prefix_len(&self.pending);
        let lines = if complete_len > 0 {
            let complete: String = self.pending.drain(..complete_len).collect();
            normalize(&complete)
        } else {
            Vec::new()
        };

        self.state = if self.pending.is_empty() {
            BufferState::Idle
        } else {
            BufferState::Accumulating {
                deadline: now + self.idle,
            }
        };
        lines
    }

    /// Flushes the partial line if the idle deadline has passed.
    ///
    /// A trailing `\r` or unfinished escape sequence is kept back for the next chunk.
    pub fn poll_idle(&mut self, now: Instant) -> Vec<String> {
        match self.state {
            BufferState::Accumulating { deadline } if now >= deadline => {}
            _ => return Vec::new(),
        }
        self.state = BufferState::Idle;

        let mut keep_from = self.pending.len();
        if self.pending.ends_with('\r') {
            keep_from -= 1;
        }
        if let Some(start) = incomplete_escape_start(&self.pending[..keep_from]) {
            keep_from = start;
        }
        let partial: String = self.pending.drain(..keep_from).collect();
        normalize(&partial)
    }

    /// Flushes everything, complete or not. Called when the command ends.
    pub fn finish(&mut self) -> Vec<String> {
        self.state = BufferState::Idle;
        let rest = std::mem::take(&mut self.pending);
        normalize(&rest)
    }
}

/// Length of the prefix that ends in a line break. A final lone `\r` may be
/// the first half of `\r\n`, so it does not count yet.
fn complete_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    for (idx, byte) in bytes.iter().enumerate().rev() {
        match byte {
            b'\n' => return idx + 1,
            b'\r' if idx + 1 < bytes.len() => return idx + 1,
            _ => {}
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_millis(100);

    #[test]
    fn newline_flushes_accumulated_text_in_order() {
        let t0 = Instant::now();
        let mut buffer = OutputBuffer::new(IDLE);
        assert!(buffer.push("ab", t0).is_empty());
        assert_eq!(buffer.state(), BufferState::Accumulating { deadline: t0 + IDLE });
        assert_eq!(buffer.push("cd\n", t0), vec!["abcd"]);
        assert_eq!(buffer.state(), BufferState::Idle);
        assert!(buffer.push("ef", t0).is_empty());
        assert_eq!(buffer.finish(), vec!["ef"]);
    }

    #[test]
    fn tail_after_newline_stays_buffered() {
        let t0 = Instant::now();
        let mut buffer = OutputBuffer::new(IDLE);
        assert_eq!(buffer.push("one\ntwo\nthr", t0), vec!["one", "two"]);
        assert_eq!(buffer.pending(), "thr");
        assert_eq!(buffer.deadline(), Some(t0 + IDLE));
    }

    #[test]
    fn idle_timeout_flushes_partial_line() {
        let t0 = Instant::now();
        let mut buffer = OutputBuffer::new(IDLE);
        buffer.push("Compiling", t0);
        assert!(buffer.poll_idle(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(buffer.poll_idle(t0 + IDLE), vec!["Compiling"]);
        assert_eq!(buffer.state(), BufferState::Idle);
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn new_data_restarts_the_idle_timer() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(80);
        let mut buffer = OutputBuffer::new(IDLE);
        buffer.push("a", t0);
        buffer.push("b", t1);
        assert!(buffer.poll_idle(t0 + IDLE).is_empty());
        assert_eq!(buffer.poll_idle(t1 + IDLE), vec!["ab"]);
    }

    #[test]
    fn split_escape_sequence_is_not_flushed_on_idle() {
        let t0 = Instant::now();
        let mut buffer = OutputBuffer::new(IDLE);
        buffer.push("ready \x1b[3", t0);
        assert_eq!(buffer.poll_idle(t0 + IDLE), vec!["ready"]);
        assert_eq!(buffer.pending(), "\x1b[3");
        assert_eq!(buffer.push("2mgo\x1b[0m\n", t0 + IDLE), vec!["go"]);
    }

    #[test]
    fn crlf_split_across_chunks_is_one_break() {
        let t0 = Instant::now();
        let mut buffer = OutputBuffer::new(IDLE);
        assert!(buffer.push("line\r", t0).is_empty());
        assert_eq!(buffer.poll_idle(t0 + IDLE), vec!["line"]);
        assert_eq!(buffer.pending(), "\r");
        assert_eq!(buffer.push("\nnext\n", t0 + IDLE), vec!["next"]);
    }

    #[test]
    fn carriage_return_redraws_become_lines() {
        let t0 = Instant::now();
        let mut buffer = OutputBuffer::new(IDLE);
        assert_eq!(buffer.push("10%\r50%\r100%\n", t0), vec!["10%", "50%", "100%"]);
    }
}
