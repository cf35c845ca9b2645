//! Subunit v2 wire codec.
//!
//! All inter-process test-event traffic uses the subunit v2 binary framing:
//! workers emit it on stdout, the repository stores runs as encoded streams,
//! and `quarry load` accepts it on stdin. This module implements the packet
//! codec and an incremental stream decoder.
//!
//! # Packet layout
//!
//! ```text
//! PACKET := SIGNATURE FLAGS LENGTH TIMESTAMP? TESTID? TAGS? MIME?
//!           FILECONTENT? ROUTE? CRC32
//! ```
//!
//! - `SIGNATURE` is the byte `0xB3`.
//! - `FLAGS` is a big-endian u16: version `0x2` in the top nibble, feature
//!   bits in the middle, the status enum in the low three bits.
//! - `LENGTH` counts the whole packet, itself included, and is capped at
//!   4MiB.
//! - Numbers use a 2-bit length prefix (1-4 bytes, big-endian); strings are
//!   a number length followed by UTF-8 bytes.
//! - `CRC32` covers every preceding byte of the packet.
//!
//! # Non-subunit bytes
//!
//! Test runners frequently interleave plain prints with the packet stream.
//! The decoder tolerates this: any bytes that do not parse as packets are
//! surfaced as a `stdout` file attachment carrying no test id, so callers
//! can forward them instead of losing them.

use std::collections::BTreeSet;
use std::fmt;

use bytes::{Buf, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

const SIGNATURE: u8 = 0xB3;
const VERSION: u16 = 0x2;
const MAX_PACKET: usize = 4 * 1024 * 1024;

const FLAG_TEST_ID: u16 = 0x0800;
const FLAG_ROUTE_CODE: u16 = 0x0400;
const FLAG_TIMESTAMP: u16 = 0x0200;
const FLAG_RUNNABLE: u16 = 0x0100;
const FLAG_TAGS: u16 = 0x0080;
const FLAG_FILE_CONTENT: u16 = 0x0040;
const FLAG_MIME_TYPE: u16 = 0x0020;
const FLAG_EOF: u16 = 0x0010;
const STATUS_MASK: u16 = 0x0007;

/// The name given to interleaved non-subunit output.
pub const NON_SUBUNIT_NAME: &str = "stdout";

/// Errors raised while encoding packets.
///
/// Decoding never errors: malformed input degrades to `stdout` attachments.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value {0} does not fit in a subunit number")]
    NumberTooLarge(u64),

    #[error("packet would exceed the 4MiB subunit limit")]
    PacketTooLarge,
}

/// Result status of a test event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    /// The test exists but was not run (enumeration streams).
    Exists,
    /// The test has started.
    InProgress,
    /// The test passed.
    Success,
    /// The test passed but was expected to fail.
    UxSuccess,
    /// The test was skipped.
    Skip,
    /// The test failed.
    Fail,
    /// The test failed and was expected to fail.
    XFail,
}

impl TestStatus {
    fn to_wire(self) -> u16 {
        match self {
            TestStatus::Exists => 0x1,
            TestStatus::InProgress => 0x2,
            TestStatus::Success => 0x3,
            TestStatus::UxSuccess => 0x4,
            TestStatus::Skip => 0x5,
            TestStatus::Fail => 0x6,
            TestStatus::XFail => 0x7,
        }
    }

    fn from_wire(code: u16) -> Option<Self> {
        match code {
            0x1 => Some(TestStatus::Exists),
            0x2 => Some(TestStatus::InProgress),
            0x3 => Some(TestStatus::Success),
            0x4 => Some(TestStatus::UxSuccess),
            0x5 => Some(TestStatus::Skip),
            0x6 => Some(TestStatus::Fail),
            0x7 => Some(TestStatus::XFail),
            _ => None,
        }
    }

    /// Whether this status ends a test (as opposed to announcing or
    /// enumerating one).
    pub fn is_terminal(self) -> bool {
        !matches!(self, TestStatus::Exists | TestStatus::InProgress)
    }

    /// Whether this status counts as a failure.
    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::UxSuccess)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestStatus::Exists => "exists",
            TestStatus::InProgress => "inprogress",
            TestStatus::Success => "success",
            TestStatus::UxSuccess => "uxsuccess",
            TestStatus::Skip => "skip",
            TestStatus::Fail => "fail",
            TestStatus::XFail => "xfail",
        };
        f.write_str(name)
    }
}

/// A single decoded test event.
///
/// Events without an `id` carry only file content (typically interleaved
/// runner output); events without a `status` attach files to a test without
/// changing its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEvent {
    pub id: Option<String>,
    pub status: Option<TestStatus>,
    pub tags: BTreeSet<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub file_name: Option<String>,
    pub file_bytes: Option<Vec<u8>>,
    pub mime_type: Option<String>,
    pub route_code: Option<String>,
    pub runnable: bool,
    pub eof: bool,
}

impl TestEvent {
    /// Creates a status event for a test id.
    pub fn new(id: impl Into<String>, status: TestStatus) -> Self {
        TestEvent {
            id: Some(id.into()),
            status: Some(status),
            tags: BTreeSet::new(),
            timestamp: None,
            file_name: None,
            file_bytes: None,
            mime_type: None,
            route_code: None,
            runnable: true,
            eof: false,
        }
    }

    /// Creates an event carrying only file content, no test id.
    pub fn file_only(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        TestEvent {
            id: None,
            status: None,
            tags: BTreeSet::new(),
            timestamp: None,
            file_name: Some(name.into()),
            file_bytes: Some(bytes),
            mime_type: None,
            route_code: None,
            runnable: true,
            eof: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.file_name = Some(name.into());
        self.file_bytes = Some(bytes);
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

fn number_size(value: u32) -> Option<usize> {
    match value {
        0..=0x3F => Some(1),
        0x40..=0x3FFF => Some(2),
        0x4000..=0x003F_FFFF => Some(3),
        0x0040_0000..=0x3FFF_FFFF => Some(4),
        _ => None,
    }
}

fn write_number(out: &mut Vec<u8>, value: u32) -> Result<(), CodecError> {
    match number_size(value).ok_or(CodecError::NumberTooLarge(value as u64))? {
        1 => out.push(value as u8),
        2 => out.extend_from_slice(&[0x40 | (value >> 8) as u8, value as u8]),
        3 => out.extend_from_slice(&[0x80 | (value >> 16) as u8, (value >> 8) as u8, value as u8]),
        _ => out.extend_from_slice(&[
            0xC0 | (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ]),
    }
    Ok(())
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    write_number(out, value.len() as u32)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Encodes one event as a subunit v2 packet, appending to `out`.
pub fn encode_event(event: &TestEvent, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let mut flags = VERSION << 12;
    if let Some(status) = event.status {
        flags |= status.to_wire();
    }
    if event.id.is_some() {
        flags |= FLAG_TEST_ID;
    }
    if event.route_code.is_some() {
        flags |= FLAG_ROUTE_CODE;
    }
    if event.timestamp.is_some() {
        flags |= FLAG_TIMESTAMP;
    }
    if event.runnable {
        flags |= FLAG_RUNNABLE;
    }
    if !event.tags.is_empty() {
        flags |= FLAG_TAGS;
    }
    if event.mime_type.is_some() {
        flags |= FLAG_MIME_TYPE;
    }
    if event.file_name.is_some() {
        flags |= FLAG_FILE_CONTENT;
    }
    if event.eof {
        flags |= FLAG_EOF;
    }

    let mut fields = Vec::new();
    if let Some(at) = event.timestamp {
        let seconds = at.timestamp().clamp(0, u32::MAX as i64) as u32;
        fields.extend_from_slice(&seconds.to_be_bytes());
        write_number(&mut fields, at.timestamp_subsec_nanos())?;
    }
    if let Some(id) = &event.id {
        write_string(&mut fields, id)?;
    }
    if !event.tags.is_empty() {
        write_number(&mut fields, event.tags.len() as u32)?;
        for tag in &event.tags {
            write_string(&mut fields, tag)?;
        }
    }
    if let Some(mime) = &event.mime_type {
        write_string(&mut fields, mime)?;
    }
    if let Some(name) = &event.file_name {
        write_string(&mut fields, name)?;
        let bytes = event.file_bytes.as_deref().unwrap_or(&[]);
        write_number(&mut fields, bytes.len() as u32)?;
        fields.extend_from_slice(bytes);
    }
    if let Some(route) = &event.route_code {
        write_string(&mut fields, route)?;
    }

    // Total length includes the length field itself, so the field width has
    // to be solved for: try each width until one is self-consistent.
    let base = 3 + fields.len() + 4;
    let mut length_field = None;
    for width in 1..=4usize {
        let total = base + width;
        if number_size(total as u32) == Some(width) {
            length_field = Some(total as u32);
            break;
        }
    }
    let total = length_field.ok_or(CodecError::PacketTooLarge)?;
    if total as usize > MAX_PACKET {
        return Err(CodecError::PacketTooLarge);
    }

    let mut packet = Vec::with_capacity(total as usize);
    packet.push(SIGNATURE);
    packet.extend_from_slice(&flags.to_be_bytes());
    write_number(&mut packet, total)?;
    packet.extend_from_slice(&fields);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&packet);
    packet.extend_from_slice(&hasher.finalize().to_be_bytes());

    out.extend_from_slice(&packet);
    Ok(())
}

/// Encodes a sequence of events as one stream.
pub fn encode_events<'a, I>(events: I) -> Result<Vec<u8>, CodecError>
where
    I: IntoIterator<Item = &'a TestEvent>,
{
    let mut out = Vec::new();
    for event in events {
        encode_event(event, &mut out)?;
    }
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn number(&mut self) -> Option<u32> {
        let first = *self.take(1)?.first()?;
        let extra = (first >> 6) as usize;
        let mut value = (first & 0x3F) as u32;
        for byte in self.take(extra)? {
            value = (value << 8) | *byte as u32;
        }
        Some(value)
    }

    fn string(&mut self) -> Option<String> {
        let len = self.number()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

enum Parsed {
    Event(TestEvent, usize),
    NeedMore,
    Invalid,
}

/// Parses one packet from the front of `data` (which starts with the
/// signature byte).
fn parse_packet(data: &[u8]) -> Parsed {
    if data.len() < 4 {
        return Parsed::NeedMore;
    }
    let flags = u16::from_be_bytes([data[1], data[2]]);
    if flags >> 12 != VERSION {
        return Parsed::Invalid;
    }

    let mut header = Reader { data, pos: 3 };
    let length_width = (data[3] >> 6) as usize + 1;
    if data.len() < 3 + length_width {
        return Parsed::NeedMore;
    }
    let total = match header.number() {
        Some(n) => n as usize,
        None => return Parsed::Invalid,
    };
    if total > MAX_PACKET || total < 3 + length_width + 4 {
        return Parsed::Invalid;
    }
    if data.len() < total {
        return Parsed::NeedMore;
    }

    let packet = &data[..total];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&packet[..total - 4]);
    let expected = u32::from_be_bytes([
        packet[total - 4],
        packet[total - 3],
        packet[total - 2],
        packet[total - 1],
    ]);
    if hasher.finalize() != expected {
        return Parsed::Invalid;
    }

    let mut reader = Reader {
        data: &packet[..total - 4],
        pos: 3 + length_width,
    };

    let mut event = TestEvent {
        id: None,
        status: TestStatus::from_wire(flags & STATUS_MASK),
        tags: BTreeSet::new(),
        timestamp: None,
        file_name: None,
        file_bytes: None,
        mime_type: None,
        route_code: None,
        runnable: flags & FLAG_RUNNABLE != 0,
        eof: flags & FLAG_EOF != 0,
    };

    if flags & FLAG_TIMESTAMP != 0 {
        let seconds = match reader.take(4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => return Parsed::Invalid,
        };
        let nanos = match reader.number() {
            Some(n) => n,
            None => return Parsed::Invalid,
        };
        event.timestamp = Utc.timestamp_opt(seconds as i64, nanos).single();
    }
    if flags & FLAG_TEST_ID != 0 {
        match reader.string() {
            Some(id) => event.id = Some(id),
            None => return Parsed::Invalid,
        }
    }
    if flags & FLAG_TAGS != 0 {
        let count = match reader.number() {
            Some(n) => n,
            None => return Parsed::Invalid,
        };
        for _ in 0..count {
            match reader.string() {
                Some(tag) => {
                    event.tags.insert(tag);
                }
                None => return Parsed::Invalid,
            }
        }
    }
    if flags & FLAG_MIME_TYPE != 0 {
        match reader.string() {
            Some(mime) => event.mime_type = Some(mime),
            None => return Parsed::Invalid,
        }
    }
    if flags & FLAG_FILE_CONTENT != 0 {
        let name = match reader.string() {
            Some(n) => n,
            None => return Parsed::Invalid,
        };
        let len = match reader.number() {
            Some(n) => n as usize,
            None => return Parsed::Invalid,
        };
        let bytes = match reader.take(len) {
            Some(b) => b.to_vec(),
            None => return Parsed::Invalid,
        };
        event.file_name = Some(name);
        event.file_bytes = Some(bytes);
    }
    if flags & FLAG_ROUTE_CODE != 0 {
        match reader.string() {
            Some(route) => event.route_code = Some(route),
            None => return Parsed::Invalid,
        }
    }

    Parsed::Event(event, total)
}

/// Incremental decoder for a subunit v2 byte stream.
///
/// Feed bytes as they arrive and drain events with
/// [`next_event`](Self::next_event). Bytes that do not parse as packets are
/// buffered and surfaced as [`NON_SUBUNIT_NAME`] attachments, preserving the
/// relative order of packets and raw output.
#[derive(Default)]
pub struct StreamDecoder {
    buf: BytesMut,
    pending_raw: Vec<u8>,
    eof: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends incoming bytes to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Marks the stream complete; trailing partial packets become raw
    /// output.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    fn raw_event(&mut self) -> TestEvent {
        TestEvent::file_only(NON_SUBUNIT_NAME, std::mem::take(&mut self.pending_raw))
    }

    /// Pops the next decoded event, or `None` when more input is needed.
    pub fn next_event(&mut self) -> Option<TestEvent> {
        loop {
            if self.buf.is_empty() {
                if self.eof && !self.pending_raw.is_empty() {
                    return Some(self.raw_event());
                }
                return None;
            }
            if self.buf[0] != SIGNATURE {
                let stop = self
                    .buf
                    .iter()
                    .position(|&b| b == SIGNATURE)
                    .unwrap_or(self.buf.len());
                let chunk = self.buf.split_to(stop);
                self.pending_raw.extend_from_slice(&chunk);
                continue;
            }
            match parse_packet(&self.buf) {
                Parsed::Event(event, consumed) => {
                    if !self.pending_raw.is_empty() {
                        // Flush buffered raw output first; the packet stays
                        // queued for the next call.
                        return Some(self.raw_event());
                    }
                    self.buf.advance(consumed);
                    return Some(event);
                }
                Parsed::NeedMore => {
                    if self.eof {
                        // Truncated trailing packet: degrade to raw bytes.
                        let chunk = self.buf.split_to(1);
                        self.pending_raw.extend_from_slice(&chunk);
                        continue;
                    }
                    if !self.pending_raw.is_empty() {
                        return Some(self.raw_event());
                    }
                    return None;
                }
                Parsed::Invalid => {
                    let chunk = self.buf.split_to(1);
                    self.pending_raw.extend_from_slice(&chunk);
                }
            }
        }
    }
}

/// Decodes a complete byte stream into events.
pub fn decode_all(bytes: &[u8]) -> Vec<TestEvent> {
    let mut decoder = StreamDecoder::new();
    decoder.feed(bytes);
    decoder.mark_eof();
    let mut events = Vec::new();
    while let Some(event) = decoder.next_event() {
        events.push(event);
    }
    events
}

/// Concatenates the file payloads of a stream, in order.
///
/// Used to surface a failed enumeration's output as plain bytes.
pub fn cat_files(events: &[TestEvent]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        if let Some(bytes) = &event.file_bytes {
            out.extend_from_slice(bytes);
        }
    }
    out
}
