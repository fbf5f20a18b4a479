//! Time query protocol.
//!
//! A client sends a command string; the server answers with its current
//! wall-clock time or with `BAD ORDER`.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  QUERY TIME ORDER        (case-insensitive, surrounding whitespace ignored)
//! Response: Thu Oct 15 09:30:00 2026
//!
//! Request:  hello
//! Response: BAD ORDER
//! ```
//!
//! Two framing modes are supported. `PerRead` treats every readable chunk as
//! one complete request and sends unterminated responses. `Line` accumulates
//! input until `\n` (an optional preceding `\r` is stripped) and terminates
//! each response with `\r\n`.

use crate::error::ConfigError;
use bytes::{Buf, BytesMut};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fmt::Write as _;

/// The only command the server understands.
pub const TIME_QUERY: &str = "QUERY TIME ORDER";

/// Reply to anything that is not [`TIME_QUERY`].
pub const BAD_ORDER: &str = "BAD ORDER";

/// Default strftime rendering of the current time.
pub const DEFAULT_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

/// Default upper bound on an unterminated request in line mode.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024;

/// How requests are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One readable chunk is one request.
    #[default]
    PerRead,
    /// Newline-delimited requests and CRLF-terminated responses.
    Line,
}

/// Parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    QueryTime,
    /// Malformed encoding or unrecognized text.
    Bad,
}

impl Command {
    /// Decode a request as UTF-8 and match it against [`TIME_QUERY`].
    pub fn parse(request: &[u8]) -> Command {
        match std::str::from_utf8(request) {
            Ok(text) if text.trim().eq_ignore_ascii_case(TIME_QUERY) => Command::QueryTime,
            _ => Command::Bad,
        }
    }
}

/// Source of the current wall-clock time.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Local>;
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Check that `format` is a strftime string chrono can render.
pub fn validate_time_format(format: &str) -> Result<(), String> {
    if format.is_empty() {
        return Err("time format is empty".to_string());
    }
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(format!("unsupported strftime specifier in '{format}'"));
    }
    Ok(())
}

/// Per-connection request accumulator.
///
/// In line mode `discarding` is set after an oversized request has been
/// answered; bytes are then dropped up to and including the next `\n`.
#[derive(Debug, Default)]
pub struct Inbound {
    bytes: BytesMut,
    discarding: bool,
}

impl Inbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True while the tail of an oversized line is being skipped.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }
}

/// Request framing plus response encoding, shared by every connection.
pub struct TimeProtocol {
    framing: Framing,
    time_format: String,
    max_request_size: usize,
    clock: Box<dyn Clock>,
}

impl TimeProtocol {
    /// Create a protocol instance, rejecting time formats chrono cannot render.
    pub fn new(
        framing: Framing,
        time_format: impl Into<String>,
        max_request_size: usize,
    ) -> Result<Self, ConfigError> {
        let time_format = time_format.into();
        validate_time_format(&time_format).map_err(|reason| ConfigError::Invalid {
            field: "protocol.time_format",
            reason,
        })?;

        Ok(Self {
            framing,
            time_format,
            max_request_size,
            clock: Box::new(SystemClock),
        })
    }

    /// Replace the clock used to render time responses.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Split the next complete request off the front of `inbound`.
    ///
    /// Returns `None` when more bytes are needed. In line mode an
    /// unterminated request that exceeds the size limit is returned whole so
    /// it gets answered with `BAD ORDER` once; the rest of that line, up to
    /// its `\n`, is then dropped without a reply.
    pub fn next_request(&self, inbound: &mut Inbound) -> Option<BytesMut> {
        if self.framing == Framing::PerRead {
            return (!inbound.bytes.is_empty()).then(|| inbound.bytes.split());
        }

        if inbound.discarding {
            match inbound.bytes.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    inbound.bytes.advance(pos + 1);
                    inbound.discarding = false;
                }
                None => {
                    inbound.bytes.clear();
                    return None;
                }
            }
        }

        match inbound.bytes.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = inbound.bytes.split_to(pos);
                inbound.bytes.advance(1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Some(line)
            }
            None if inbound.bytes.len() > self.max_request_size => {
                inbound.discarding = true;
                Some(inbound.bytes.split())
            }
            None => None,
        }
    }

    /// Encode the response to `request` onto the end of `out`.
    pub fn respond(&self, request: &[u8], out: &mut BytesMut) -> Command {
        let command = Command::parse(request);
        match command {
            Command::QueryTime => {
                let now = self.clock.now();
                let mark = out.len();
                if write!(out, "{}", now.format(&self.time_format)).is_err() {
                    // Unreachable for formats accepted by `new`
                    out.truncate(mark);
                    out.extend_from_slice(BAD_ORDER.as_bytes());
                }
            }
            Command::Bad => out.extend_from_slice(BAD_ORDER.as_bytes()),
        }
        if self.framing == Framing::Line {
            out.extend_from_slice(b"\r\n");
        }
        command
    }
}

impl Default for TimeProtocol {
    fn default() -> Self {
        Self {
            framing: Framing::PerRead,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            clock: Box::new(SystemClock),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{NaiveDateTime, TimeZone};
    use rstest::rstest;

    /// Clock pinned to a single instant.
    pub(crate) struct FixedClock(pub DateTime<Local>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Local> {
            self.0
        }
    }

    pub(crate) fn fixed_clock() -> FixedClock {
        FixedClock(Local.with_ymd_and_hms(2026, 10, 15, 9, 30, 0).unwrap())
    }

    #[rstest]
    #[case(b"QUERY TIME ORDER", Command::QueryTime)]
    #[case(b"query time order", Command::QueryTime)]
    #[case(b"Query Time Order", Command::QueryTime)]
    #[case(b"  QUERY TIME ORDER\r\n", Command::QueryTime)]
    #[case(b"\tquery time order \n", Command::QueryTime)]
    #[case(b"", Command::Bad)]
    #[case(b"hello", Command::Bad)]
    #[case(b"QUERY TIME", Command::Bad)]
    #[case(b"QUERY  TIME ORDER", Command::Bad)]
    #[case(b"QUERY TIME ORDERS", Command::Bad)]
    #[case(b"\xff\xfeQUERY TIME ORDER", Command::Bad)]
    #[case(b"QUERY TIME ORDER\x80", Command::Bad)]
    fn test_parse(#[case] input: &[u8], #[case] expected: Command) {
        assert_eq!(Command::parse(input), expected);
    }

    #[test]
    fn test_respond_time() {
        let protocol = TimeProtocol::default().with_clock(fixed_clock());
        let mut out = BytesMut::new();

        let command = protocol.respond(b"query time order", &mut out);

        assert_eq!(command, Command::QueryTime);
        assert_eq!(&out[..], b"Thu Oct 15 09:30:00 2026");
        let text = std::str::from_utf8(&out).unwrap();
        assert!(NaiveDateTime::parse_from_str(text, DEFAULT_TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_respond_bad_order() {
        let protocol = TimeProtocol::default().with_clock(fixed_clock());
        let mut out = BytesMut::new();

        assert_eq!(protocol.respond(b"hello", &mut out), Command::Bad);
        assert_eq!(&out[..], BAD_ORDER.as_bytes());
    }

    #[test]
    fn test_respond_appends_line_terminator() {
        let protocol = TimeProtocol::new(Framing::Line, "%Y-%m-%d", 64)
            .unwrap()
            .with_clock(fixed_clock());
        let mut out = BytesMut::from(&b"prior"[..]);

        protocol.respond(b"QUERY TIME ORDER", &mut out);
        protocol.respond(b"nope", &mut out);

        assert_eq!(&out[..], b"prior2026-10-15\r\nBAD ORDER\r\n");
    }

    #[test]
    fn test_new_rejects_invalid_time_format() {
        let err = TimeProtocol::new(Framing::PerRead, "%Q", 64).err().unwrap();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "protocol.time_format",
                ..
            }
        ));
        assert!(TimeProtocol::new(Framing::PerRead, "", 64).is_err());
    }

    #[test]
    fn test_per_read_takes_whole_buffer() {
        let protocol = TimeProtocol::default();
        let mut inbound = Inbound::new();
        inbound.extend_from_slice(b"QUERY TIME\nORDER");

        let request = protocol.next_request(&mut inbound).unwrap();
        assert_eq!(&request[..], b"QUERY TIME\nORDER");
        assert!(inbound.is_empty());
        assert!(protocol.next_request(&mut inbound).is_none());
    }

    #[test]
    fn test_line_framing_splits_and_reassembles() {
        let protocol = TimeProtocol::new(Framing::Line, DEFAULT_TIME_FORMAT, 64).unwrap();
        let mut inbound = Inbound::new();
        inbound.extend_from_slice(b"QUERY TIME ORDER\r\nhel");

        let first = protocol.next_request(&mut inbound).unwrap();
        assert_eq!(&first[..], b"QUERY TIME ORDER");
        assert!(protocol.next_request(&mut inbound).is_none());
        assert_eq!(inbound.as_slice(), b"hel");

        inbound.extend_from_slice(b"lo\n\n");
        assert_eq!(&protocol.next_request(&mut inbound).unwrap()[..], b"hello");
        assert_eq!(&protocol.next_request(&mut inbound).unwrap()[..], b"");
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_line_framing_caps_unterminated_request() {
        let protocol = TimeProtocol::new(Framing::Line, DEFAULT_TIME_FORMAT, 1024).unwrap();
        let mut inbound = Inbound::new();
        let mut line = vec![b'x'; 3000];
        line.push(b'\n');
        line.extend_from_slice(b"QUERY TIME ORDER\n");

        // Delivered in read-sized chunks, as a socket would
        let mut requests = Vec::new();
        for chunk in line.chunks(1024) {
            inbound.extend_from_slice(chunk);
            while let Some(request) = protocol.next_request(&mut inbound) {
                requests.push(request);
            }
        }

        // One request for the whole oversized line, then the next real one
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].len(), 2048);
        assert_eq!(&requests[1][..], b"QUERY TIME ORDER");
        assert!(!inbound.is_discarding());
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_line_framing_discard_spans_chunks() {
        let protocol = TimeProtocol::new(Framing::Line, DEFAULT_TIME_FORMAT, 8).unwrap();
        let mut inbound = Inbound::new();

        inbound.extend_from_slice(b"123456789");
        assert_eq!(protocol.next_request(&mut inbound).unwrap().len(), 9);
        assert!(inbound.is_discarding());

        inbound.extend_from_slice(b"more tail");
        assert!(protocol.next_request(&mut inbound).is_none());
        assert!(inbound.is_discarding());
        assert!(inbound.is_empty());

        inbound.extend_from_slice(b"end\r\nhello\n");
        assert_eq!(&protocol.next_request(&mut inbound).unwrap()[..], b"hello");
        assert!(!inbound.is_discarding());
    }

    #[rstest]
    #[case(DEFAULT_TIME_FORMAT, true)]
    #[case("%Y-%m-%dT%H:%M:%S%:z", true)]
    #[case("", false)]
    #[case("%Q", false)]
    fn test_validate_time_format(#[case] format: &str, #[case] valid: bool) {
        assert_eq!(validate_time_format(format).is_ok(), valid);
    }
}
