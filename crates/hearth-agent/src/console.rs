use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, mpsc};

use crate::events::{AgentEvent, EventBroadcaster, LogLine, LogStream};
use crate::presence::PresenceInput;

/// Bounded scrollback of console lines with monotonically increasing
/// sequence numbers, so the control surface can poll with a cursor.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, LogLine)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: LogLine) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Lines strictly after `cursor`, up to `limit`, plus the new cursor.
    /// Cursor 0 is a convenience for UI polling: the most recent lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogLine>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Fan-out point for one console line: scrollback buffer, event subscribers,
/// and the presence tracker. The presence feed is unbounded and the event
/// bus drops laggards, so emitting never blocks the stream reader.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    events: EventBroadcaster,
    presence_tx: mpsc::UnboundedSender<PresenceInput>,
}

impl LogSink {
    pub fn new(
        buffer: Arc<Mutex<LogBuffer>>,
        events: EventBroadcaster,
        presence_tx: mpsc::UnboundedSender<PresenceInput>,
    ) -> Self {
        Self {
            buffer,
            events,
            presence_tx,
        }
    }

    pub async fn emit(&self, stream: LogStream, line: String) {
        let entry = LogLine {
            stream,
            line: line.clone(),
        };
        self.buffer.lock().await.push_line(entry.clone());
        self.events.publish(AgentEvent::Log(entry));
        // The tracker may already be gone during shutdown.
        let _ = self.presence_tx.send(PresenceInput::Line(line));
    }
}

/// Read one child stream to EOF, forwarding each line to the sink. Lines are
/// split on newline boundaries; a non-empty trailing fragment at EOF is
/// flushed as a final line by `lines()`.
pub fn spawn_stream_reader<R>(
    reader: R,
    stream: LogStream,
    sink: LogSink,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.emit(stream, line).await;
        }
    })
}
