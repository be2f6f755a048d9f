//! Turns raw output bytes into lines and hands them to readers through bounded queues.
//!
//! A reader thread owns a [`LineSink`] and pushes complete lines as data arrives; the
//! process owns the matching [`LineQueue`] and pops them with a deadline.

use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError},
        Mutex,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use tracing::{debug, trace, warn};

use crate::timed::{time_left, TimeoutError};

/// Lines buffered per stream before the reader thread blocks (stdout) or drops lines (stderr).
pub(crate) const LINE_QUEUE_CAPACITY: usize = 1024;

const READ_CHUNK: usize = 4096;

/// Longest line kept in memory. Longer output is cut into lines of this size.
pub(crate) const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug)]
pub(crate) enum LineEvent {
    Line(String),
    Eof,
}

/// Splits a byte stream on `\n`, holding partial lines until the rest arrives.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    partial: Vec<u8>,
    flush_partial: bool,
}

impl LineSplitter {
    /// With `flush_partial`, a fragment still pending at the end of a chunk is emitted as a
    /// line instead of waiting for its newline.
    pub(crate) fn new(flush_partial: bool) -> LineSplitter {
        LineSplitter {
            partial: Vec::new(),
            flush_partial,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for piece in chunk.split_inclusive(|b| *b == b'\n') {
            match piece.split_last() {
                Some((&b'\n', content)) => {
                    self.append(content, &mut lines);
                    lines.push(self.take_partial());
                }
                _ => self.append(piece, &mut lines),
            }
        }
        if self.flush_partial && !self.partial.is_empty() {
            lines.push(self.take_partial());
        }
        lines
    }

    fn append(&mut self, mut bytes: &[u8], lines: &mut Vec<String>) {
        while self.partial.len() + bytes.len() > MAX_LINE_BYTES {
            let room = MAX_LINE_BYTES - self.partial.len();
            self.partial.extend_from_slice(&bytes[..room]);
            debug!(max = MAX_LINE_BYTES, "line too long, cutting it");
            lines.push(self.take_partial());
            bytes = &bytes[room..];
        }
        self.partial.extend_from_slice(bytes);
    }

    /// Whatever is left once the stream ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        (!self.partial.is_empty()).then(|| self.take_partial())
    }

    fn take_partial(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Copies stderr lines somewhere a human can read them.
#[derive(Debug)]
pub(crate) struct Mirror {
    pub(crate) label: String,
    pub(crate) to_tracing: bool,
    pub(crate) file: Option<File>,
}

impl Mirror {
    fn emit(&mut self, line: &str) {
        if self.to_tracing {
            debug!(target: "agent_stderr", agent = %self.label, "{line}");
        }
        if let Some(file) = &mut self.file {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(agent = %self.label, "could not write error log, disabling it: {e}");
                self.file = None;
            }
        }
    }
}

/// Writer half: feeds bytes, sends complete lines.
#[derive(Debug)]
pub(crate) struct LineSink {
    splitter: LineSplitter,
    tx: SyncSender<LineEvent>,
    /// stdout must never lose a line; stderr may, rather than stall the agent.
    lossy: bool,
    mirror: Option<Mirror>,
}

impl LineSink {
    /// Returns false once nobody listens anymore.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> bool {
        for line in self.splitter.push(chunk) {
            if !self.send(line) {
                return false;
            }
        }
        true
    }

    pub(crate) fn finish(&mut self) {
        if let Some(line) = self.splitter.finish() {
            self.send(line);
        }
        let _ = self.tx.send(LineEvent::Eof);
    }

    fn send(&mut self, line: String) -> bool {
        if let Some(mirror) = &mut self.mirror {
            mirror.emit(&line);
        }
        if self.lossy {
            match self.tx.try_send(LineEvent::Line(line)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!("line queue full, dropping line");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        } else {
            self.tx.send(LineEvent::Line(line)).is_ok()
        }
    }
}

/// Reader half: blocking pops with a deadline.
#[derive(Debug)]
pub(crate) struct LineQueue {
    rx: Mutex<Receiver<LineEvent>>,
    ended: AtomicBool,
}

impl LineQueue {
    /// Next complete line, `Ok(None)` once the stream ended.
    pub(crate) fn recv(&self, deadline: Option<Instant>) -> Result<Option<String>, TimeoutError> {
        if self.ended.load(Ordering::Acquire) {
            return Ok(None);
        }
        let rx = self.rx.lock().expect("poisoned");
        let event = match time_left(deadline) {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(left) => rx.recv_timeout(left),
        };
        match event {
            Ok(LineEvent::Line(line)) => Ok(Some(line)),
            Ok(LineEvent::Eof) | Err(RecvTimeoutError::Disconnected) => {
                self.ended.store(true, Ordering::Release);
                Ok(None)
            }
            Err(RecvTimeoutError::Timeout) => Err(TimeoutError {}),
        }
    }

    /// A line that is already available, without waiting.
    pub(crate) fn try_recv(&self) -> Option<String> {
        if self.ended.load(Ordering::Acquire) {
            return None;
        }
        let rx = self.rx.lock().expect("poisoned");
        match rx.try_recv() {
            Ok(LineEvent::Line(line)) => Some(line),
            Ok(LineEvent::Eof) | Err(TryRecvError::Disconnected) => {
                self.ended.store(true, Ordering::Release);
                None
            }
            Err(TryRecvError::Empty) => None,
        }
    }

    pub(crate) fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// A connected sink/queue pair.
pub(crate) fn line_channel(
    flush_partial: bool,
    lossy: bool,
    mirror: Option<Mirror>,
) -> (LineSink, LineQueue) {
    let (tx, rx) = mpsc::sync_channel(LINE_QUEUE_CAPACITY);
    (
        LineSink {
            splitter: LineSplitter::new(flush_partial),
            tx,
            lossy,
            mirror,
        },
        LineQueue {
            rx: Mutex::new(rx),
            ended: AtomicBool::new(false),
        },
    )
}

/// Pump `source` into `sink` on a dedicated thread until end of stream.
pub(crate) fn spawn_reader(
    name: String,
    mut source: impl Read + Send + 'static,
    mut sink: LineSink,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !sink.feed(&buf[..n]) {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!("stream read error: {e}");
                    break;
                }
            }
        }
        sink.finish();
    })
}
