use std::{fmt, str::FromStr};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version,
    header::{CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHORIZATION, TRANSFER_ENCODING, USER_AGENT},
    uri::Uri,
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, e};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::{error::TunnelError, util::Prebuffered};

/// Default port for targets that do not specify one.
pub const DEFAULT_TARGET_PORT: u16 = 80;

/// Non-standard header still honoured by most forward proxies.
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Host and port authority, as used in the CONNECT request target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    /// Hostname or IP literal without scheme or brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses an authority-form string such as `example.com:443` or `[::1]:8080`.
    ///
    /// Note: the port is mandatory.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        let uri = Uri::from_str(s).std_context("Invalid authority string")?;
        n0_error::ensure_any!(uri.scheme().is_none(), "Expected authority without scheme");
        let authority = uri.authority().context("Expected URI with authority")?;
        let port = authority.port_u16().context("Expected authority with port")?;
        Ok(Self::new(strip_brackets(authority.host()), port))
    }

    pub(crate) fn to_addr(&self) -> String {
        self.to_string()
    }
}

/// A proxy or target host as supplied by the caller.
///
/// The port is optional: targets fall back to [`DEFAULT_TARGET_PORT`], while a
/// proxy must always name its port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHost {
    pub scheme: String,
    pub host: String,
    /// `None` and `Some(0)` both mean "unspecified".
    pub port: Option<u16>,
}

impl HttpHost {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Shorthand for an `http` host.
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new("http", host, Some(port))
    }

    /// Resolves the CONNECT authority for this host used as tunnel target.
    pub fn target_authority(&self) -> Result<Authority, TunnelError> {
        self.validate_host("target host")?;
        let port = match self.port {
            Some(port) if port > 0 => port,
            _ => DEFAULT_TARGET_PORT,
        };
        Ok(Authority::new(self.host.clone(), port))
    }

    /// Resolves the socket authority for this host used as proxy.
    pub fn proxy_authority(&self) -> Result<Authority, TunnelError> {
        self.validate_host("proxy host")?;
        match self.port {
            Some(port) if port > 0 => Ok(Authority::new(self.host.clone(), port)),
            _ => Err(e!(TunnelError::InvalidArgument {
                what: "proxy host",
                reason: format!("no port given for proxy {}", self.host),
            })),
        }
    }

    fn validate_host(&self, what: &'static str) -> Result<(), TunnelError> {
        let reason = if self.host.is_empty() {
            "empty hostname".to_string()
        } else if let Some(c) = self
            .host
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '@' | '[' | ']'))
        {
            format!("illegal character {c:?} in hostname {:?}", self.host)
        } else {
            return Ok(());
        };
        Err(e!(TunnelError::InvalidArgument { what, reason }))
    }
}

impl fmt::Display for HttpHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) if port > 0 => write!(f, "{}://{}:{}", self.scheme, host, port),
            _ => write!(f, "{}://{}", self.scheme, host),
        }
    }
}

impl FromStr for HttpHost {
    type Err = TunnelError;

    /// Accepts `scheme://host[:port][/]`, `host:port` and bare `host`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| {
            e!(TunnelError::InvalidArgument {
                what: "host",
                reason,
            })
        };
        let uri = Uri::from_str(s.trim()).map_err(|err| invalid(format!("{s:?}: {err}")))?;
        if uri.path_and_query().is_some_and(|p| !matches!(p.as_str(), "" | "/")) {
            return Err(invalid(format!("{s:?} must not contain a path")));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| invalid(format!("{s:?} has no host")))?;
        let host = Self::new(
            uri.scheme_str().unwrap_or("http"),
            strip_brackets(authority.host()),
            authority.port_u16(),
        );
        host.validate_host("host")?;
        Ok(host)
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// An HTTP/1.1 `CONNECT` request with authority-form request target.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    target: Authority,
    headers: HeaderMap,
}

impl ConnectRequest {
    /// Builds the request and adds the standard request headers.
    pub fn new(target: Authority, user_agent: Option<&str>) -> Self {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&target.to_string()) {
            Ok(value) => {
                headers.insert(HOST, value);
            }
            Err(_) => warn!(%target, "target cannot be used as Host header value"),
        }
        if let Some(agent) = user_agent {
            match HeaderValue::from_str(agent) {
                Ok(value) => {
                    headers.insert(USER_AGENT, value);
                }
                Err(_) => warn!(agent, "ignoring invalid user agent"),
            }
        }
        headers.insert(PROXY_CONNECTION, HeaderValue::from_static("Keep-Alive"));
        Self { target, headers }
    }

    pub fn method(&self) -> Method {
        Method::CONNECT
    }

    pub fn target(&self) -> &Authority {
        &self.target
    }

    /// The literal request target, `host:port`.
    pub fn request_target(&self) -> String {
        self.target.to_string()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn auth_header(&self) -> Option<&HeaderValue> {
        self.headers.get(PROXY_AUTHORIZATION)
    }

    /// Sets `Proxy-Authorization`, replacing a value from a previous attempt.
    pub fn set_auth_header(&mut self, value: HeaderValue) {
        self.headers.insert(PROXY_AUTHORIZATION, value);
    }

    pub fn remove_auth_header(&mut self) {
        self.headers.remove(PROXY_AUTHORIZATION);
    }

    /// Whether the request itself asks for the connection to be closed.
    pub(crate) fn wants_close(&self) -> bool {
        header_tokens(&self.headers, &CONNECTION).any(|token| token == "close")
    }

    /// Serializes the request line and header section.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("CONNECT {} HTTP/1.1\r\n", self.target).into_bytes();
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    pub(crate) async fn write(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }
}

/// Parsed HTTP response with status, reason, headers and an optional
/// buffered body.
#[derive(derive_more::Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
    /// Body bytes, present only once the body has been buffered.
    #[debug("{:?}", body.as_ref().map(|b| b.len()))]
    pub body: Option<Bytes>,
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        write!(f, "{version} {} {}", self.status.as_u16(), self.reason())
    }
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, res)| res))
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut more_headers;
        match Self::parse_into(buf, &mut headers) {
            Err(httparse::Error::TooManyHeaders) => {
                // every header line takes at least three bytes
                more_headers = vec![httparse::EMPTY_HEADER; buf.len() / 3 + 1];
                Self::parse_into(buf, &mut more_headers)
            }
            res => res,
        }
        .std_context("Failed to parse HTTP response")?
        .map(|(len, res)| Self::from_parsed(res).map(|res| (len, res)))
        .transpose()
    }

    fn parse_into<'h, 'b>(
        buf: &'b [u8],
        headers: &'h mut [httparse::Header<'b>],
    ) -> Result<Option<(usize, httparse::Response<'h, 'b>)>, httparse::Error> {
        let mut res = httparse::Response::new(headers);
        Ok(match res.parse(buf)? {
            httparse::Status::Partial => None,
            httparse::Status::Complete(header_len) => Some((header_len, res)),
        })
    }

    fn from_parsed(res: httparse::Response<'_, '_>) -> Result<Self> {
        let code = res.code.context("Missing response status code")?;
        let status = StatusCode::from_u16(code).std_context("Invalid response status code")?;
        let version = match res.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let reason = res
            .reason
            .filter(|reason| !reason.is_empty())
            .map(ToOwned::to_owned);
        let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));
        Ok(HttpResponse {
            version,
            status,
            reason,
            headers,
            body: None,
        })
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Removes the header section from `reader`; the body (if any) stays buffered.
    pub async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Self, TunnelError> {
        loop {
            match Self::parse_with_len(reader.buffer()) {
                Ok(Some((len, response))) => {
                    reader.discard(len);
                    return Ok(response);
                }
                Ok(None) => {}
                Err(source) => return Err(e!(TunnelError::MalformedResponse { source })),
            }
            if reader.is_full() {
                return Err(e!(TunnelError::MalformedResponse {
                    source: anyerr!("Buffer size limit reached before end of response header section"),
                }));
            }
            if reader.buffer_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed the connection before completing the response head",
                )
                .into());
            }
        }
    }

    /// Lower-cased, comma-separated tokens of `name`.
    pub fn header_tokens<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = String> + 'a {
        header_tokens(&self.headers, name)
    }

    pub fn body_framing(&self) -> BodyFraming {
        BodyFraming::of(self)
    }
}

fn header_tokens<'a>(
    headers: &'a HeaderMap,
    name: &'a HeaderName,
) -> impl Iterator<Item = String> + 'a {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
}

/// How the body of a response to a CONNECT request is delimited (RFC 9112 §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body: 1xx, 204, 304, or a 2xx answer to CONNECT.
    Empty,
    ContentLength(u64),
    Chunked,
    /// The body ends when the proxy closes the connection.
    UntilClose,
    /// Conflicting or unparsable `Content-Length`.
    Invalid,
}

impl BodyFraming {
    pub fn of(response: &HttpResponse) -> Self {
        let status = response.status;
        if status.is_informational()
            || status.is_success()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return BodyFraming::Empty;
        }
        let codings: Vec<String> = response.header_tokens(&TRANSFER_ENCODING).collect();
        if let Some(last) = codings.last() {
            return if last == "chunked" && response.version != Version::HTTP_10 {
                BodyFraming::Chunked
            } else {
                BodyFraming::UntilClose
            };
        }
        let mut length = None;
        for value in response.headers.get_all(CONTENT_LENGTH) {
            let Ok(value) = value.to_str() else {
                return BodyFraming::Invalid;
            };
            for part in value.split(',') {
                match part.trim().parse::<u64>() {
                    Ok(n) if length.is_none_or(|prev| prev == n) => length = Some(n),
                    _ => return BodyFraming::Invalid,
                }
            }
        }
        match length {
            Some(0) => BodyFraming::Empty,
            Some(n) => BodyFraming::ContentLength(n),
            None => BodyFraming::UntilClose,
        }
    }

    /// Whether the end of the body can be found without closing the connection.
    pub fn is_self_delimited(self) -> bool {
        matches!(
            self,
            BodyFraming::Empty | BodyFraming::ContentLength(_) | BodyFraming::Chunked
        )
    }
}
