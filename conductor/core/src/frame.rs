//! Event-Stream Frame Decoder
//!
//! Turns raw response-body chunks into `data:` records.
//!
//! # Record Format
//!
//! ```text
//! data: {"type":"agent_response","agent":"logical_agent",...}\n
//! \n
//! data: {"type":"end"}\n
//! ```
//!
//! Every newline-terminated line starting with the literal prefix `data: `
//! becomes one [`EventRecord`]. Blank separators, `event:` lines and `:`
//! comments are dropped.
//!
//! Chunk boundaries are arbitrary: they may fall inside a record, inside the
//! prefix, or inside a multi-byte UTF-8 character. The decoder buffers bytes
//! until a newline arrives, so the decoded sequence does not depend on how the
//! transport sliced the body.
//!
//! No record size limit is enforced here. A line that never terminates simply
//! grows the carry buffer.

/// Literal prefix that marks a record line
pub const DATA_PREFIX: &str = "data: ";

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// One decoded `data:` line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    /// Text after the `data: ` prefix (a JSON object on a well-behaved server)
    pub payload: String,
}

impl EventRecord {
    /// Create a record from its payload text
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Decoder state machine for streaming record parsing
///
/// Buffers incoming bytes and yields complete records.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Position where the newline search resumes (`>= read_pos`)
    scan_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
        }
    }

    /// Append a chunk to the carry buffer
    pub fn push(&mut self, chunk: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet consumed (the partial trailing line)
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next record
    ///
    /// Returns `None` once only an incomplete line (or nothing) is left.
    /// Lines without the `data: ` prefix are skipped.
    pub fn next_record(&mut self) -> Option<EventRecord> {
        loop {
            // Bytes before scan_pos are known to hold no newline
            let unscanned = &self.buffer[self.scan_pos..];
            let Some(newline) = unscanned.iter().position(|&b| b == b'\n') else {
                self.scan_pos = self.buffer.len();
                return None;
            };
            let line_end = self.scan_pos + newline;
            let record = parse_line(&self.buffer[self.read_pos..line_end]);
            self.read_pos = line_end + 1;
            self.scan_pos = self.read_pos;

            if record.is_some() {
                return record;
            }
        }
    }

    /// Push a chunk and drain every record it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<EventRecord> {
        self.push(chunk);
        let mut records = Vec::new();
        while let Some(record) = self.next_record() {
            records.push(record);
        }
        records
    }

    /// Flush the trailing unterminated line at end of stream
    ///
    /// A server that closes the body without a final newline still gets its
    /// last record delivered.
    pub fn finish(&mut self) -> Option<EventRecord> {
        if self.pending_bytes() == 0 {
            self.clear();
            return None;
        }
        let record = parse_line(&self.buffer[self.read_pos..]);
        self.clear();
        record
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
    }
}

/// Convert one complete line into a record, if it carries the data prefix
fn parse_line(line: &[u8]) -> Option<EventRecord> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX.as_bytes())?;
    Some(EventRecord::new(String::from_utf8_lossy(payload)))
}
