use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;
use warden_proto::proto::{LogLine, LogStream};

use crate::util::now_millis;

/// Bounded in-memory tail of server output and manager logs, with followers.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Mutex<LogState>>,
}

struct LogState {
    server: VecDeque<LogLine>,
    manager: VecDeque<LogLine>,
    server_tx: broadcast::Sender<LogLine>,
    manager_tx: broadcast::Sender<LogLine>,
    max_lines: usize,
}

impl LogStore {
    pub fn new(max_lines: usize) -> Self {
        let (server_tx, _) = broadcast::channel(1024);
        let (manager_tx, _) = broadcast::channel(1024);
        let max_lines = max_lines.max(1);
        Self {
            inner: Arc::new(Mutex::new(LogState {
                server: VecDeque::with_capacity(max_lines.min(1024)),
                manager: VecDeque::with_capacity(max_lines.min(1024)),
                server_tx,
                manager_tx,
                max_lines,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_server(&self, stream: LogStream, line: String) {
        let mut guard = self.state();
        let entry = LogLine {
            at_ms: now_millis(),
            stream,
            line,
        };
        let max_lines = guard.max_lines;
        push_bounded(&mut guard.server, max_lines, entry.clone());
        let _ = guard.server_tx.send(entry);
    }

    pub fn push_manager(&self, line: String) {
        let mut guard = self.state();
        let entry = LogLine {
            at_ms: now_millis(),
            stream: LogStream::Manager,
            line,
        };
        let max_lines = guard.max_lines;
        push_bounded(&mut guard.manager, max_lines, entry.clone());
        let _ = guard.manager_tx.send(entry);
    }

    pub fn tail_server(&self, lines: usize) -> Vec<LogLine> {
        tail(&self.state().server, lines)
    }

    pub fn tail_manager(&self, lines: usize) -> Vec<LogLine> {
        tail(&self.state().manager, lines)
    }

    pub fn server_subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.state().server_tx.subscribe()
    }

    pub fn manager_subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.state().manager_tx.subscribe()
    }

    pub fn manager_writer(&self) -> LogWriterFactory {
        LogWriterFactory { store: self.clone() }
    }
}

fn push_bounded(buf: &mut VecDeque<LogLine>, max_lines: usize, entry: LogLine) {
    while buf.len() >= max_lines {
        buf.pop_front();
    }
    buf.push_back(entry);
}

fn tail(buf: &VecDeque<LogLine>, lines: usize) -> Vec<LogLine> {
    let count = lines.min(buf.len());
    buf.iter().skip(buf.len() - count).cloned().collect()
}

/// `MakeWriter` that tees formatted tracing output into the manager log tail.
pub struct LogWriterFactory {
    store: LogStore,
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            store: self.store.clone(),
            buffer: Vec::new(),
        }
    }
}

pub struct LogWriter {
    store: LogStore,
    buffer: Vec<u8>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if !line.trim().is_empty() {
                self.store.push_manager(line);
            }
        }

        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}
