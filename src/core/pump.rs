//! Output pump
//!
//! Drains the child's output stream on a background thread, decodes it as
//! UTF-8 and forwards text fragments to an [`OutputSink`] in arrival order.

use std::io::{self, Read};
use std::sync::mpsc::Sender;

use tracing::{debug, warn};

use super::monitor::CancelToken;
use super::filter::ControlSequenceFilter;

/// Default read size for the output stream.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Receiver of decoded output.
pub trait OutputSink: Send + 'static {
    fn output(&mut self, text: &str);
}

impl<F> OutputSink for F
where
    F: FnMut(&str) + Send + 'static,
{
    fn output(&mut self, text: &str) {
        self(text)
    }
}

impl OutputSink for Sender<String> {
    fn output(&mut self, text: &str) {
        // The receiver going away only means nobody is listening any more.
        let _ = self.send(text.to_string());
    }
}

/// Text decoded from one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub text: String,
    /// Raw bytes folded into `text`, including any carried over from the
    /// previous read.
    pub consumed: usize,
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte sequence cut by a read boundary is held back until the rest
/// arrives. Bytes that can never form a valid sequence become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> OutputChunk {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut text = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // The first `valid_up_to` bytes always decode.
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end: keep for next read.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let held = rest.len();
        self.pending = rest.to_vec();
        OutputChunk {
            text,
            consumed: input.len() - held,
        }
    }

    /// End of stream: a dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.clear();
        Some(char::REPLACEMENT_CHARACTER.to_string())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Why the pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    EndOfStream,
    Cancelled,
    Failed(io::Error),
}

/// Blocking read loop from the output stream to a sink.
pub struct OutputPump<R, S> {
    reader: R,
    sink: S,
    decoder: Utf8Decoder,
    filter: Option<ControlSequenceFilter>,
    buffer_size: usize,
}

impl<R: Read, S: OutputSink> OutputPump<R, S> {
    pub fn new(reader: R, sink: S, strip_escapes: bool) -> Self {
        Self {
            reader,
            sink,
            decoder: Utf8Decoder::new(),
            filter: strip_escapes.then(ControlSequenceFilter::new),
            buffer_size: READ_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Run until end of stream, cancellation, or a read error.
    pub fn run(mut self, cancel: &CancelToken) -> PumpExit {
        let mut buffer = vec![0u8; self.buffer_size];

        let exit = loop {
            if cancel.is_cancelled() {
                break PumpExit::Cancelled;
            }

            match self.reader.read(&mut buffer) {
                Ok(0) => {
                    if cancel.is_cancelled() {
                        break PumpExit::Cancelled;
                    }
                    if let Some(tail) = self.decoder.finish() {
                        self.emit(&tail);
                    }
                    break PumpExit::EndOfStream;
                }
                Ok(n) => {
                    // Nothing reaches the sink once disposal has begun.
                    if cancel.is_cancelled() {
                        break PumpExit::Cancelled;
                    }
                    let chunk = self.decoder.decode(&buffer[..n]);
                    self.emit(&chunk.text);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "output stream read failed");
                    break PumpExit::Failed(err);
                }
            }
        };

        if let Some(filter) = self.filter.as_mut() {
            filter.finish();
        }
        debug!(?exit, "output pump stopped");
        exit
    }

    fn emit(&mut self, text: &str) {
        let text = match self.filter.as_mut() {
            Some(filter) => filter.filter(text),
            None => text.to_string(),
        };
        if !text.is_empty() {
            self.sink.output(&text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Hands out one scripted chunk per read.
    struct ScriptedReader {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(chunks: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Ok(0),
                Some(Err(err)) => Err(err),
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    fn collect() -> (Arc<Mutex<Vec<String>>>, impl OutputSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (seen, move |text: &str| sink_seen.lock().unwrap().push(text.to_string()))
    }

    #[test]
    fn test_emoji_split_across_reads() {
        let emoji = "🎉".as_bytes();
        assert_eq!(emoji.len(), 4);

        let mut decoder = Utf8Decoder::new();
        let first = decoder.decode(&emoji[..2]);
        assert_eq!(first.text, "");
        assert_eq!(first.consumed, 0);
        assert!(decoder.has_pending());

        let second = decoder.decode(&emoji[2..]);
        assert_eq!(second.text, "🎉");
        assert_eq!(second.consumed, 4);
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb").text, "a\u{fffd}b");
    }

    #[test]
    fn test_dangling_tail_at_end() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&"é".as_bytes()[..1]).text, "");
        assert_eq!(decoder.finish(), Some("\u{fffd}".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_pump_emits_one_character_for_split_emoji() {
        let bytes = "ok 🎉!".as_bytes().to_vec();
        let reader = ScriptedReader::new(vec![Ok(bytes[..5].to_vec()), Ok(bytes[5..].to_vec())]);
        let (seen, sink) = collect();

        let exit = OutputPump::new(reader, sink, false).run(&CancelToken::new());
        assert!(matches!(exit, PumpExit::EndOfStream));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.concat(), "ok 🎉!");
        assert!(seen.iter().all(|s| !s.contains('\u{fffd}')));
        assert!(seen.iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn test_pump_strips_when_enabled() {
        let reader = ScriptedReader::new(vec![
            Ok(b"\x1b[31mHELLO\x1b[0m\r\n".to_vec()),
            Ok(b"\x1b[32m".to_vec()),
            Ok(b"WORLD\r\n".to_vec()),
        ]);
        let (seen, sink) = collect();
        OutputPump::new(reader, sink, true).run(&CancelToken::new());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.concat(), "HELLO\nWORLD\n");
        // The chunk that was only an escape sequence produced nothing.
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_pump_reports_read_failure() {
        let reader = ScriptedReader::new(vec![
            Ok(b"before".to_vec()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
        ]);
        let (seen, sink) = collect();
        let exit = OutputPump::new(reader, sink, false).run(&CancelToken::new());
        assert!(matches!(exit, PumpExit::Failed(_)));
        assert_eq!(seen.lock().unwrap().concat(), "before");
    }

    #[test]
    fn test_pump_stops_when_cancelled() {
        let reader = ScriptedReader::new(vec![Ok(b"never".to_vec())]);
        let (seen, sink) = collect();
        let cancel = CancelToken::new();
        cancel.cancel();
        let exit = OutputPump::new(reader, sink, false).run(&cancel);
        assert!(matches!(exit, PumpExit::Cancelled));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = ScriptedReader::new(vec![Ok(b"a".to_vec()), Ok(b"b".to_vec())]);
        OutputPump::new(reader, tx, false).with_buffer_size(1).run(&CancelToken::new());
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
