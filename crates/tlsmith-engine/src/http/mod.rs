//! HTTP/1.1 request and response messages carried as TLS application data.
//!
//! Bodies are delimited by Content-Length only; chunked transfer coding is
//! not understood and such a body is left in the byte stream.

use tlsmith_types::EngineError;

use crate::state::ConnectionState;
use crate::unit::{
    Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitFamily, UnitKind, UnitRegistry,
};

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// One header line. Name and value are raw bytes so that invalid header
/// syntax can be sent.
#[derive(Debug, Clone, Default)]
pub struct HttpHeader {
    pub name: Field<Vec<u8>>,
    pub value: Field<Vec<u8>>,
}

impl HttpHeader {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: Field::with_value(name.as_bytes().to_vec()),
            value: Field::with_value(value.as_bytes().to_vec()),
        }
    }

    fn write(&self, unit: &'static str, out: &mut Vec<u8>) -> Result<(), EngineError> {
        out.extend_from_slice(&self.name.require(unit, "header_name")?);
        out.extend_from_slice(b": ");
        out.extend_from_slice(&self.value.require(unit, "header_value")?);
        out.extend_from_slice(CRLF);
        Ok(())
    }

    fn is(&self, name: &str) -> bool {
        self.name
            .get()
            .is_some_and(|n| n.eq_ignore_ascii_case(name.as_bytes()))
    }

    fn to_pair(&self) -> (String, String) {
        let text =
            |f: &Field<Vec<u8>>| String::from_utf8_lossy(&f.get().unwrap_or_default()).into_owned();
        (text(&self.name), text(&self.value))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(headers: &[HttpHeader]) -> Option<usize> {
    headers
        .iter()
        .find(|h| h.is("content-length"))
        .and_then(|h| h.value.get())
        .and_then(|v| std::str::from_utf8(&v).ok()?.trim().parse().ok())
}

/// Parsed start line, header list and body.
struct Parsed {
    start: [Vec<u8>; 3],
    headers: Vec<HttpHeader>,
    body: Vec<u8>,
}

type Head = ([Vec<u8>; 3], Vec<HttpHeader>);

fn parse_head(r: &mut Reader<'_>) -> Result<Head, EngineError> {
    let rest = &r.data()[r.position()..];
    let head_len = find(rest, HEAD_END).ok_or_else(|| r.malformed("header_end"))?;
    let head = r.read_bytes(head_len, "head")?;
    r.read_bytes(HEAD_END.len(), "header_end")?;

    let mut lines = head.split(|b| *b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));
    let start_line = lines.next().unwrap_or_default();
    let mut parts = start_line.splitn(3, |b| *b == b' ');
    let mut start: [Vec<u8>; 3] = Default::default();
    for slot in start.iter_mut() {
        *slot = parts.next().ok_or_else(|| r.malformed("start_line"))?.to_vec();
    }

    let mut headers = Vec::new();
    for line in lines {
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| r.malformed("header"))?;
        let value = &line[colon + 1..];
        let skip = value.iter().take_while(|b| b.is_ascii_whitespace()).count();
        let value = &value[skip..];
        headers.push(HttpHeader {
            name: Field::with_value(line[..colon].to_vec()),
            value: Field::with_value(value.to_vec()),
        });
    }
    Ok((start, headers))
}

fn parse(r: &mut Reader<'_>) -> Result<Parsed, EngineError> {
    let (start, headers) = parse_head(r)?;
    let body_len = content_length(&headers).unwrap_or(0);
    let body = r.read_bytes(body_len, "body")?.to_vec();
    Ok(Parsed {
        start,
        headers,
        body,
    })
}

fn write_message(
    unit: &'static str,
    start: [&Field<Vec<u8>>; 3],
    headers: &Option<Vec<HttpHeader>>,
    body: &Field<Vec<u8>>,
) -> Result<Vec<u8>, EngineError> {
    let body = body.require(unit, "body")?;
    let mut out = Vec::with_capacity(128 + body.len());
    for (i, part) in start.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(&part.require(unit, "start_line")?);
    }
    out.extend_from_slice(CRLF);
    for header in headers.iter().flatten() {
        header.write(unit, &mut out)?;
    }
    out.extend_from_slice(CRLF);
    out.extend_from_slice(&body);
    Ok(out)
}

fn header_pairs(headers: &Option<Vec<HttpHeader>>) -> Vec<(String, String)> {
    headers.iter().flatten().map(HttpHeader::to_pair).collect()
}

/// An HTTP/1.1 request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: Field<Vec<u8>>,
    pub target: Field<Vec<u8>>,
    pub version: Field<Vec<u8>>,
    /// `None` until compute-defaults fills Host, User-Agent and, for a
    /// non-empty body, Content-Length.
    pub headers: Option<Vec<HttpHeader>>,
    pub body: Field<Vec<u8>>,
}

impl RegisteredUnit for HttpRequest {
    const KIND: UnitKind = UnitKind::new(UnitFamily::Http, 0);
    const NAME: &'static str = "HttpRequest";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let Parsed {
            start: [method, target, version],
            headers,
            body,
        } = parse(r)?;
        Ok(Self {
            method: Field::with_value(method),
            target: Field::with_value(target),
            version: Field::with_value(version),
            headers: Some(headers),
            body: Field::with_value(body),
        })
    }
}

impl ProtocolUnit for HttpRequest {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        let config = state.config();
        self.method.fill(|| b"GET".to_vec());
        self.target.fill(|| config.http_path.as_bytes().to_vec());
        self.version.fill(|| b"HTTP/1.1".to_vec());
        self.body.fill(Vec::new);
        let body_len = self.body.emitted_len();
        self.headers.get_or_insert_with(|| {
            let host = config.server_name.as_deref().unwrap_or("localhost");
            let mut headers = vec![
                HttpHeader::new("Host", host),
                HttpHeader::new("User-Agent", &config.http_user_agent),
            ];
            if body_len > 0 {
                headers.push(HttpHeader::new("Content-Length", &body_len.to_string()));
            }
            headers
        });
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        write_message(
            Self::NAME,
            [&self.method, &self.target, &self.version],
            &self.headers,
            &self.body,
        )
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let target = self
                .target
                .get()
                .map(|t| String::from_utf8_lossy(&t).into_owned());
            let headers = header_pairs(&self.headers);
            state.record_negotiated("http_request", |n| {
                n.http_request_target = target;
                n.http_headers = headers;
            });
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// An HTTP/1.1 response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub version: Field<Vec<u8>>,
    pub status: Field<Vec<u8>>,
    pub reason: Field<Vec<u8>>,
    /// `None` until compute-defaults fills Content-Length.
    pub headers: Option<Vec<HttpHeader>>,
    pub body: Field<Vec<u8>>,
}

impl HttpResponse {
    pub fn status_code(&self) -> Option<u16> {
        let status = self.status.get()?;
        std::str::from_utf8(&status).ok()?.parse().ok()
    }
}

impl RegisteredUnit for HttpResponse {
    const KIND: UnitKind = UnitKind::new(UnitFamily::Http, 1);
    const NAME: &'static str = "HttpResponse";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let Parsed {
            start: [version, status, reason],
            headers,
            body,
        } = parse(r)?;
        Ok(Self {
            version: Field::with_value(version),
            status: Field::with_value(status),
            reason: Field::with_value(reason),
            headers: Some(headers),
            body: Field::with_value(body),
        })
    }
}

impl ProtocolUnit for HttpResponse {
    fn compute_defaults(&mut self, _state: &ConnectionState) -> Result<(), EngineError> {
        self.version.fill(|| b"HTTP/1.1".to_vec());
        self.status.fill(|| b"200".to_vec());
        self.reason.fill(|| b"OK".to_vec());
        self.body.fill(Vec::new);
        let body_len = self.body.emitted_len();
        self.headers.get_or_insert_with(|| {
            vec![HttpHeader::new("Content-Length", &body_len.to_string())]
        });
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        write_message(
            Self::NAME,
            [&self.version, &self.status, &self.reason],
            &self.headers,
            &self.body,
        )
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received {
            let status = self.status_code();
            let headers = header_pairs(&self.headers);
            state.record_negotiated("http_response", |n| {
                n.http_status = status;
                n.http_headers = headers;
            });
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

/// Kind of the message at the start of `buffer`.
pub fn kind_of(buffer: &[u8]) -> UnitKind {
    if buffer.starts_with(b"HTTP/") {
        HttpResponse::KIND
    } else {
        HttpRequest::KIND
    }
}

/// Length of the complete message at the start of `buffer`, once its head
/// and Content-Length body have arrived. A length past `usize::MAX` never
/// completes.
pub fn frame_len(buffer: &[u8]) -> Option<usize> {
    let head = find(buffer, HEAD_END)? + HEAD_END.len();
    let mut r = Reader::new("Http", &buffer[..head]);
    let (_, headers) = parse_head(&mut r).ok()?;
    let total = head.checked_add(content_length(&headers).unwrap_or(0))?;
    (buffer.len() >= total).then_some(total)
}

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register(HttpRequest::registration());
    registry.register(HttpResponse::registration());
}
