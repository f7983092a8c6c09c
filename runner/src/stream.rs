//! Child process output handling.
//!
//! A model instance's child process talks back over stdout. The bytes go to
//! three places at once: the operator's log, a bounded diagnostic buffer
//! (stderr only) and a per-model parser that turns framed lines into typed
//! task responses. The tee here fans one line out to all sinks; the parsers
//! own nothing but a little accumulation state.

use std::collections::VecDeque;

use fleet_common::{RunnerTaskResponse, TaskResponseType};

/// Keeps the last `cap` bytes written to it. Used to retain a stderr tail
/// for crash diagnostics.
pub struct TailBuffer {
    cap: usize,
    buf: VecDeque<u8>,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: VecDeque::with_capacity(cap),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == self.cap {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    pub fn contents(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One consumer of a line stream.
pub trait LineSink: Send {
    fn write_line(&mut self, line: &str);
}

/// Writes each line to every sink, each with its own buffering.
pub struct Tee {
    sinks: Vec<Box<dyn LineSink>>,
}

impl Tee {
    pub fn new(sinks: Vec<Box<dyn LineSink>>) -> Self {
        Self { sinks }
    }

    pub fn write_line(&mut self, line: &str) {
        for sink in &mut self.sinks {
            sink.write_line(line);
        }
    }
}

/// Echoes child output into the runner's own log.
pub struct ConsoleSink {
    prefix: String,
}

impl ConsoleSink {
    pub fn new(prefix: String) -> Self {
        Self { prefix }
    }
}

impl LineSink for ConsoleSink {
    fn write_line(&mut self, line: &str) {
        tracing::debug!("[{}] {}", self.prefix, line);
    }
}

/// Appends lines to a shared tail buffer.
pub struct TailSink {
    buffer: std::sync::Arc<std::sync::Mutex<TailBuffer>>,
}

impl TailSink {
    pub fn new(buffer: std::sync::Arc<std::sync::Mutex<TailBuffer>>) -> Self {
        Self { buffer }
    }
}

impl LineSink for TailSink {
    fn write_line(&mut self, line: &str) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.write(line.as_bytes());
        buffer.write(b"\n");
    }
}

/// Feeds lines through a parser and forwards the responses it emits.
pub struct ParserSink {
    parser: Box<dyn StreamParser>,
    tx: tokio::sync::mpsc::UnboundedSender<RunnerTaskResponse>,
}

impl ParserSink {
    pub fn new(
        parser: Box<dyn StreamParser>,
        tx: tokio::sync::mpsc::UnboundedSender<RunnerTaskResponse>,
    ) -> Self {
        Self { parser, tx }
    }
}

impl LineSink for ParserSink {
    fn write_line(&mut self, line: &str) {
        for response in self.parser.parse_line(line) {
            if self.tx.send(response).is_err() {
                return;
            }
        }
    }
}

/// Turns one line of child stdout into zero or more task responses.
///
/// Each model decides its own framing, so there is one parser per model
/// family. Emitted responses carry only what the child printed; the model
/// instance tags owner and interaction before forwarding.
pub trait StreamParser: Send {
    fn parse_line(&mut self, line: &str) -> Vec<RunnerTaskResponse>;
}

const SESSION_START: &str = "[SESSION_START]";
const SESSION_END: &str = "[SESSION_END]";
const EOS: &str = "</s>";

/// Parser for the sentinel-marker text format.
///
/// The child prints ` [SESSION_START]session_id=<id> `, then generated text
/// lines, then an end-of-sequence token and ` [SESSION_END]session_id=<id> `.
/// Text lines become `stream` chunks; the end marker produces the terminal
/// `result` carrying the accumulated message.
pub struct SentinelTextParser {
    session_id: Option<String>,
    message: String,
}

impl SentinelTextParser {
    pub fn new() -> Self {
        Self {
            session_id: None,
            message: String::new(),
        }
    }

    fn marker_session_id(line: &str) -> Option<String> {
        let idx = line.find("session_id=")?;
        let rest = &line[idx + "session_id=".len()..];
        let id = rest.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }
}

impl Default for SentinelTextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for SentinelTextParser {
    fn parse_line(&mut self, line: &str) -> Vec<RunnerTaskResponse> {
        if line.contains(SESSION_START) {
            self.session_id = Self::marker_session_id(line);
            self.message.clear();
            return vec![];
        }

        if line.contains(SESSION_END) {
            let Some(session_id) = self.session_id.take() else {
                return vec![];
            };
            let message = std::mem::take(&mut self.message);
            return vec![RunnerTaskResponse {
                response_type: TaskResponseType::Result,
                session_id,
                interaction_id: String::new(),
                owner: String::new(),
                message: message.trim_end().to_string(),
                progress: 0,
                status: String::new(),
                files: vec![],
                lora_dir: String::new(),
                error: String::new(),
                done: true,
            }];
        }

        let Some(session_id) = self.session_id.clone() else {
            // boot noise before the first session marker
            return vec![];
        };

        let chunk = line.replace(EOS, "");
        if chunk.trim().is_empty() {
            return vec![];
        }
        let chunk = format!("{}\n", chunk.trim_end());
        self.message.push_str(&chunk);
        vec![RunnerTaskResponse {
            response_type: TaskResponseType::Stream,
            session_id,
            interaction_id: String::new(),
            owner: String::new(),
            message: chunk,
            progress: 0,
            status: String::new(),
            files: vec![],
            lora_dir: String::new(),
            error: String::new(),
            done: false,
        }]
    }
}

/// Parser for the JSON-per-line envelope format used by fine-tune and image
/// runtimes. Non-JSON lines are passed over silently (they are progress bars
/// and framework chatter).
pub struct JsonLineParser;

impl StreamParser for JsonLineParser {
    fn parse_line(&mut self, line: &str) -> Vec<RunnerTaskResponse> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return vec![];
        }
        match serde_json::from_str::<RunnerTaskResponse>(trimmed) {
            Ok(response) => vec![response],
            Err(e) => {
                tracing::warn!("unparseable response line from child: {}", e);
                vec![]
            }
        }
    }
}
