//! Process input with a deadline.
//!
//! Writes to a pipe block once the pipe buffer is full, and an agent that never reads its input
//! would then hold the turn forever. A writer thread owns the pipe instead; callers hand it a
//! line and wait for the acknowledgement only until their deadline.

use std::{
    io::Write,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender, SyncSender},
        Mutex,
    },
    thread,
    time::Instant,
};

use tracing::trace;

use crate::{error::WriteError, timed::time_left};

struct Request {
    bytes: Vec<u8>,
    done: SyncSender<std::io::Result<()>>,
}

/// Input side of a process, served by a dedicated writer thread.
#[derive(Debug)]
pub(crate) struct InputPipe {
    tx: Mutex<Option<Sender<Request>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("len", &self.bytes.len()).finish()
    }
}

impl InputPipe {
    /// Write `line` and a newline, waiting for the process to take it until `deadline`.
    ///
    /// On timeout the line stays queued: it is still delivered if the process catches up, and
    /// dropped when the pipe is closed.
    pub(crate) fn write_line(&self, line: &str, deadline: Option<Instant>) -> Result<(), WriteError> {
        let tx = match self.tx.lock().expect("poisoned").as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(WriteError::Closed("input was closed".to_string())),
        };
        let (done, ack) = mpsc::sync_channel(1);
        let request = Request {
            bytes: format!("{line}\n").into_bytes(),
            done,
        };
        if tx.send(request).is_err() {
            return Err(self.closed("writer stopped"));
        }
        let result = match time_left(deadline) {
            None => ack.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(left) => ack.recv_timeout(left),
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.closed(&e.to_string())),
            Err(RecvTimeoutError::Timeout) => Err(WriteError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed("writer stopped")),
        }
    }

    /// Stop accepting lines. The pipe is closed once the pending write returns.
    pub(crate) fn close(&self) {
        self.tx.lock().expect("poisoned").take();
    }

    fn closed(&self, reason: &str) -> WriteError {
        self.close();
        WriteError::Closed(reason.to_string())
    }
}

/// Serve `sink` on a dedicated thread until the pipe is closed or a write fails.
pub(crate) fn spawn_writer(
    name: String,
    mut sink: impl Write + Send + 'static,
) -> std::io::Result<InputPipe> {
    let (tx, rx) = mpsc::channel::<Request>();
    thread::Builder::new().name(name).spawn(move || {
        for request in rx {
            let written = sink.write_all(&request.bytes).and_then(|_| sink.flush());
            let failed = written.is_err();
            if let Err(e) = &written {
                trace!("input write failed: {e}");
            }
            // the caller may have given up waiting
            let _ = request.done.send(written);
            if failed {
                break;
            }
        }
    })?;
    Ok(InputPipe {
        tx: Mutex::new(Some(tx)),
    })
}
