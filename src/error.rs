use std::io;

use http::StatusCode;
use n0_error::{AnyError, e, stack_error};

use crate::parse::{Authority, HttpResponse};

/// Errors returned by [`ProxyClient::tunnel`](crate::ProxyClient::tunnel).
///
/// Every variant is terminal for the negotiation that produced it. Whenever
/// an error is returned the proxy connection has already been closed.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum TunnelError {
    /// The proxy or target host is malformed. Raised before any I/O.
    #[error("invalid {what}: {reason}")]
    InvalidArgument { what: &'static str, reason: String },

    /// The TCP connection to the proxy could not be established.
    #[error("failed to connect to proxy {proxy}")]
    ProxyConnect {
        proxy: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Reading from or writing to the proxy failed or timed out.
    #[error("i/o error on proxy connection")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The proxy sent something that is not an HTTP/1.x response.
    #[error("malformed response from proxy")]
    MalformedResponse {
        #[error(source)]
        source: AnyError,
    },

    /// The proxy answered the CONNECT request with an informational status.
    #[error("unexpected response to CONNECT request: {status}")]
    UnexpectedResponse { status: StatusCode },

    /// The proxy kept demanding authentication and no further answer could
    /// be produced: no supported scheme was offered, credentials were
    /// missing or rejected, or the round limit was reached.
    #[error("proxy authentication failed: {response}")]
    AuthExhausted { response: Box<HttpResponse> },

    /// The proxy refused to open the tunnel.
    #[error("CONNECT refused by proxy: {response}")]
    TunnelRefused { response: Box<HttpResponse> },
}

impl From<io::Error> for TunnelError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(TunnelError::Io { source })
    }
}

impl TunnelError {
    /// Returns the final proxy response for refusals, with its body buffered.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            TunnelError::AuthExhausted { response, .. }
            | TunnelError::TunnelRefused { response, .. } => Some(response.as_ref()),
            _ => None,
        }
    }

    /// Whether the proxy answered with a definitive non-success response.
    pub fn is_refusal(&self) -> bool {
        self.response().is_some()
    }

    /// Whether the negotiation failed at the transport level.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TunnelError::ProxyConnect { .. } | TunnelError::Io { .. }
        )
    }

    /// Returns the HTTP status an outer proxy server should send its own
    /// client for this failure.
    pub fn response_status(&self) -> StatusCode {
        match self {
            TunnelError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            TunnelError::ProxyConnect { .. } => StatusCode::GATEWAY_TIMEOUT,
            TunnelError::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                StatusCode::GATEWAY_TIMEOUT
            }
            TunnelError::AuthExhausted { response, .. }
            | TunnelError::TunnelRefused { response, .. } => response.status,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
