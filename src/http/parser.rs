//! Incremental HTTP/1.x request parser built on [`httparse`].
//!
//! The connection owns a read buffer and hands it to [`HttpParser::feed`]
//! after every socket read. The parser consumes as many bytes as it can,
//! reports what it found through [`ParserCallbacks`], and pauses after each
//! complete message so pipelined bytes stay in the buffer for the next call.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use super::Method;

/// Maximum number of headers accepted in one request head.
const MAX_HEADERS: usize = 64;

/// Protocol errors. Any of these is fatal for the connection.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error(transparent)]
    Method(#[from] super::UnknownMethod),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("invalid Content-Length header")]
    ContentLength,

    #[error("invalid chunked transfer encoding")]
    Chunked,
}

/// Receiver for parser events, in the order they occur within one message.
pub trait ParserCallbacks {
    fn on_message_begin(&mut self, method: Method);

    /// The request target exactly as it appeared on the request line.
    fn on_url(&mut self, url: &str);

    fn on_header(&mut self, name: &str, value: &[u8]);

    /// Called once the head is parsed, before any body bytes.
    fn on_headers_complete(&mut self, version: (u8, u8), upgrade: bool);

    fn on_body(&mut self, chunk: &[u8]);

    fn on_message_complete(&mut self);
}

/// Outcome of one [`HttpParser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed before the current message can finish.
    Partial,
    /// A full message was delivered; unread bytes remain in the buffer.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkEnd,
    Trailers,
}

/// Push parser for a stream of HTTP/1.x requests.
#[derive(Debug)]
pub struct HttpParser {
    state: State,
    max_head_size: usize,
    version: (u8, u8),
    upgrade: bool,
}

impl HttpParser {
    pub fn new(max_head_size: usize) -> Self {
        Self {
            state: State::Head,
            max_head_size,
            version: (1, 1),
            upgrade: false,
        }
    }

    /// `(major, minor)` version of the most recent request head.
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn check_version(&self, major: u8, minor: u8) -> bool {
        self.version == (major, minor)
    }

    /// Whether the most recent request asked to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// Returns `true` while no part of a message has been consumed.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head
    }

    /// Consumes bytes from `buf`, emitting events into `cb`.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the bytes cannot be a valid request.
    /// The parser must not be fed again after an error.
    pub fn feed<C: ParserCallbacks>(
        &mut self,
        buf: &mut BytesMut,
        cb: &mut C,
    ) -> Result<Progress, ParseError> {
        loop {
            match self.state {
                State::Head => {
                    let Some(next) = self.parse_head(buf, cb)? else {
                        return Ok(Progress::Partial);
                    };
                    match next {
                        Some(state) => self.state = state,
                        None => return Ok(self.finish(cb)),
                    }
                }
                State::Body { remaining } => {
                    if buf.is_empty() {
                        return Ok(Progress::Partial);
                    }
                    let take = remaining.min(buf.len());
                    cb.on_body(&buf[..take]);
                    buf.advance(take);
                    if take == remaining {
                        return Ok(self.finish(cb));
                    }
                    self.state = State::Body {
                        remaining: remaining - take,
                    };
                }
                State::ChunkSize => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        buf.advance(consumed);
                        let size = usize::try_from(size).map_err(|_| ParseError::Chunked)?;
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                    Ok(httparse::Status::Partial) => return Ok(Progress::Partial),
                    Err(_) => return Err(ParseError::Chunked),
                },
                State::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return Ok(Progress::Partial);
                    }
                    let take = remaining.min(buf.len());
                    cb.on_body(&buf[..take]);
                    buf.advance(take);
                    self.state = if take == remaining {
                        State::ChunkEnd
                    } else {
                        State::ChunkData {
                            remaining: remaining - take,
                        }
                    };
                }
                State::ChunkEnd => {
                    if buf.len() < 2 {
                        return Ok(Progress::Partial);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::Chunked);
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    // Trailer fields are skipped line by line until the empty line.
                    let Some(eol) = buf.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(Progress::Partial);
                    };
                    buf.advance(eol + 2);
                    if eol == 0 {
                        return Ok(self.finish(cb));
                    }
                }
            }
        }
    }

    fn finish<C: ParserCallbacks>(&mut self, cb: &mut C) -> Progress {
        self.state = State::Head;
        cb.on_message_complete();
        Progress::Complete
    }

    // Ok(None): head incomplete. Ok(Some(None)): message has no body.
    fn parse_head<C: ParserCallbacks>(
        &mut self,
        buf: &mut BytesMut,
        cb: &mut C,
    ) -> Result<Option<Option<State>>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > self.max_head_size {
                    return Err(ParseError::HeadTooLarge {
                        limit: self.max_head_size,
                    });
                }
                return Ok(None);
            }
        };

        // httparse only reports Complete once method, path and version are set.
        let method: Method = req.method.unwrap_or_default().parse()?;
        cb.on_message_begin(method);
        cb.on_url(req.path.unwrap_or("/"));

        let mut content_length: Option<usize> = None;
        let mut chunked = false;
        let mut upgrade_header = false;
        let mut connection_upgrade = false;

        for header in req.headers.iter() {
            cb.on_header(header.name, header.value);

            let value = std::str::from_utf8(header.value).unwrap_or("");
            if header.name.eq_ignore_ascii_case("content-length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ParseError::ContentLength)?;
                if content_length.is_some_and(|prev| prev != len) {
                    return Err(ParseError::ContentLength);
                }
                content_length = Some(len);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value
                    .split(',')
                    .next_back()
                    .is_some_and(|t| t.trim().eq_ignore_ascii_case("chunked"));
            } else if header.name.eq_ignore_ascii_case("upgrade") {
                upgrade_header = true;
            } else if header.name.eq_ignore_ascii_case("connection") {
                connection_upgrade |= value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
            }
        }

        self.version = (1, req.version.unwrap_or(1));
        self.upgrade = method == Method::Connect || (upgrade_header && connection_upgrade);
        cb.on_headers_complete(self.version, self.upgrade);

        buf.advance(head_len);

        // Bytes after an upgrade head belong to the new protocol.
        let next = if self.upgrade {
            None
        } else if chunked {
            Some(State::ChunkSize)
        } else {
            match content_length {
                Some(len) if len > 0 => Some(State::Body { remaining: len }),
                _ => None,
            }
        };
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        method: Option<Method>,
        url: String,
        headers: Vec<(String, String)>,
        version: (u8, u8),
        upgrade: bool,
        body: Vec<u8>,
        completed: usize,
    }

    impl ParserCallbacks for Recorder {
        fn on_message_begin(&mut self, method: Method) {
            self.method = Some(method);
        }
        fn on_url(&mut self, url: &str) {
            self.url = url.to_owned();
        }
        fn on_header(&mut self, name: &str, value: &[u8]) {
            self.headers
                .push((name.to_owned(), String::from_utf8_lossy(value).into_owned()));
        }
        fn on_headers_complete(&mut self, version: (u8, u8), upgrade: bool) {
            self.version = version;
            self.upgrade = upgrade;
        }
        fn on_body(&mut self, chunk: &[u8]) {
            self.body.extend_from_slice(chunk);
        }
        fn on_message_complete(&mut self) {
            self.completed += 1;
        }
    }

    fn feed_all(input: &[u8]) -> (HttpParser, Recorder, BytesMut, Progress) {
        let mut parser = HttpParser::new(8192);
        let mut rec = Recorder::default();
        let mut buf = BytesMut::from(input);
        let progress = parser.feed(&mut buf, &mut rec).unwrap();
        (parser, rec, buf, progress)
    }

    #[test]
    fn simple_get() {
        let (parser, rec, buf, progress) =
            feed_all(b"GET /a?b=1 HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(progress, Progress::Complete);
        assert_eq!(rec.method, Some(Method::Get));
        assert_eq!(rec.url, "/a?b=1");
        assert_eq!(rec.headers, vec![("Host".into(), "localhost".into())]);
        assert!(parser.check_version(1, 1));
        assert!(buf.is_empty());
        assert_eq!(rec.completed, 1);
    }

    #[test]
    fn partial_head_then_rest() {
        let mut parser = HttpParser::new(8192);
        let mut rec = Recorder::default();
        let mut buf = BytesMut::from(&b"POST /x HTTP/1.0\r\nContent-Le"[..]);
        assert_eq!(parser.feed(&mut buf, &mut rec).unwrap(), Progress::Partial);
        assert_eq!(rec.method, None);

        buf.extend_from_slice(b"ngth: 5\r\n\r\nhel");
        assert_eq!(parser.feed(&mut buf, &mut rec).unwrap(), Progress::Partial);
        assert_eq!(rec.body, b"hel");
        assert!(!parser.is_idle());

        buf.extend_from_slice(b"lo");
        assert_eq!(parser.feed(&mut buf, &mut rec).unwrap(), Progress::Complete);
        assert_eq!(rec.body, b"hello");
        assert_eq!(parser.version(), (1, 0));
    }

    #[test]
    fn pauses_between_pipelined_messages() {
        let (mut parser, mut rec, mut buf, progress) =
            feed_all(b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\nGET /2 HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(progress, Progress::Complete);
        assert_eq!(rec.url, "/1");
        assert!(!buf.is_empty());

        assert_eq!(parser.feed(&mut buf, &mut rec).unwrap(), Progress::Complete);
        assert_eq!(rec.url, "/2");
        assert_eq!(rec.completed, 2);
    }

    #[test]
    fn chunked_body_with_trailer() {
        let (_, rec, buf, progress) = feed_all(
            b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n",
        );
        assert_eq!(progress, Progress::Complete);
        assert_eq!(rec.body, b"Wikipedia");
        assert!(buf.is_empty());
    }

    #[test]
    fn upgrade_leaves_remaining_bytes() {
        let (parser, rec, buf, progress) = feed_all(
            b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x81\x00",
        );
        assert_eq!(progress, Progress::Complete);
        assert!(parser.is_upgrade());
        assert!(rec.upgrade);
        assert_eq!(&buf[..], b"\x81\x00");
    }

    #[test]
    fn rejects_garbage_and_unknown_methods() {
        let mut parser = HttpParser::new(8192);
        let mut rec = Recorder::default();
        let mut buf = BytesMut::from(&b"\x00\x01 nonsense\r\n\r\n"[..]);
        assert!(parser.feed(&mut buf, &mut rec).is_err());

        let mut parser = HttpParser::new(8192);
        let mut buf = BytesMut::from(&b"BREW /pot HTTP/1.1\r\n\r\n"[..]);
        assert!(matches!(
            parser.feed(&mut buf, &mut rec),
            Err(ParseError::Method(_))
        ));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut parser = HttpParser::new(16);
        let mut rec = Recorder::default();
        let mut buf = BytesMut::from(&b"GET /a-very-long-path-without-end"[..]);
        assert!(matches!(
            parser.feed(&mut buf, &mut rec),
            Err(ParseError::HeadTooLarge { limit: 16 })
        ));
    }

    #[test]
    fn conflicting_content_length() {
        let mut parser = HttpParser::new(8192);
        let mut rec = Recorder::default();
        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"[..]);
        assert!(matches!(
            parser.feed(&mut buf, &mut rec),
            Err(ParseError::ContentLength)
        ));
    }
}
