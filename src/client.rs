//! Negotiates CONNECT tunnels through a forward proxy.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::StatusCode;
use n0_error::e;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tracing::{debug, instrument};

#[cfg(windows)]
use crate::auth::SspiCredentialsProvider;
use crate::{
    auth::{AuthExchange, AuthSchemeRegistry, ChallengeHandler},
    config::TunnelConfig,
    connection::{ConnectionOptions, DefaultReuseStrategy, ProxyConnection, ReuseStrategy},
    credentials::{AuthScope, BasicCredentialsProvider, Credentials, CredentialsProvider},
    error::TunnelError,
    parse::{Authority, ConnectRequest, HttpHost, HttpResponse},
    util::Prebuffered,
};

/// Establishes tunnels through an HTTP proxy with `CONNECT`, answering
/// `407 Proxy Authentication Required` challenges along the way.
///
/// The client is cheap to clone and holds no per-tunnel state; any number of
/// [`tunnel`](Self::tunnel) calls may run concurrently.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    config: Arc<TunnelConfig>,
    registry: Arc<AuthSchemeRegistry>,
    credentials: Arc<dyn CredentialsProvider>,
    reuse_strategy: Arc<dyn ReuseStrategy>,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::from_config(TunnelConfig::default())
    }
}

impl ProxyClient {
    /// Creates a client that answers challenges with `credentials`.
    ///
    /// The enabled schemes are taken from `config.auth_schemes`.
    pub fn new(config: TunnelConfig, credentials: impl CredentialsProvider + 'static) -> Self {
        Self {
            registry: Arc::new(AuthSchemeRegistry::new(config.auth_schemes.iter().copied())),
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            reuse_strategy: Arc::new(DefaultReuseStrategy),
        }
    }

    /// Creates a client whose credentials come from the `[credentials]`
    /// section of `config`.
    ///
    /// Without that section no challenge can be answered.
    pub fn from_config(config: TunnelConfig) -> Self {
        let credentials = credentials_from_config(&config);
        Self {
            registry: Arc::new(AuthSchemeRegistry::new(config.auth_schemes.iter().copied())),
            config: Arc::new(config),
            credentials,
            reuse_strategy: Arc::new(DefaultReuseStrategy),
        }
    }

    pub fn with_credentials(mut self, credentials: impl CredentialsProvider + 'static) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    pub fn with_reuse_strategy(mut self, strategy: impl ReuseStrategy + 'static) -> Self {
        self.reuse_strategy = Arc::new(strategy);
        self
    }

    pub fn with_registry(mut self, registry: AuthSchemeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn registry(&self) -> &AuthSchemeRegistry {
        &self.registry
    }

    /// Opens a tunnel to `target` through `proxy`.
    ///
    /// A target without port is reached on port 80. On success the returned
    /// [`Tunnel`] carries the open proxy connection; on failure the connection
    /// is closed and refusals carry the proxy's final response, body included.
    #[instrument("tunnel", skip_all, fields(%proxy, %target))]
    pub async fn tunnel(&self, proxy: &HttpHost, target: &HttpHost) -> Result<Tunnel, TunnelError> {
        let proxy = proxy.proxy_authority()?;
        let target = target.target_authority()?;
        match self.config.request_timeout() {
            None => self.negotiate(proxy, target).await,
            Some(timeout) => tokio::time::timeout(timeout, self.negotiate(proxy, target))
                .await
                .unwrap_or_else(|_elapsed| {
                    debug!(?timeout, "request timeout elapsed");
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out negotiating the tunnel",
                    )
                    .into())
                }),
        }
    }

    async fn negotiate(&self, proxy: Authority, target: Authority) -> Result<Tunnel, TunnelError> {
        let handler = ChallengeHandler::new(
            &self.registry,
            self.credentials.as_ref(),
            &proxy,
            self.config.header_charset,
        );
        let mut conn = ProxyConnection::new(proxy.clone(), ConnectionOptions::from(&*self.config));
        let mut request = ConnectRequest::new(target, self.config.user_agent.as_deref());
        let mut exchange = AuthExchange::new(self.config.max_auth_rounds);

        let mut response = loop {
            conn.ensure_open().await?;
            handler.attach_header(&mut request, &mut exchange);
            let response = conn.execute(&request).await?;
            debug!(
                status = %response.status,
                auth = ?exchange.state(),
                "proxy responded"
            );
            if response.status.is_informational() {
                conn.close().await;
                return Err(e!(TunnelError::UnexpectedResponse {
                    status: response.status
                }));
            }
            if handler.on_response(&mut exchange, &response) {
                if self.reuse_strategy.keep_alive(&request, &response) {
                    conn.drain_body(&response).await?;
                } else {
                    conn.close().await;
                }
                request.remove_auth_header();
                continue;
            }
            break response;
        };

        match Outcome::of(response.status) {
            Outcome::Established => {
                debug!(
                    attempts = exchange.rounds() + 1,
                    connections = conn.opened(),
                    "tunnel established"
                );
                let stream = conn
                    .into_stream()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
                Ok(Tunnel { stream, response })
            }
            Outcome::AuthExhausted => {
                conn.buffer_body(&mut response).await;
                conn.close().await;
                debug!(
                    rounds = exchange.rounds(),
                    connections = conn.opened(),
                    closed = conn.closed(),
                    "proxy authentication exhausted"
                );
                Err(e!(TunnelError::AuthExhausted {
                    response: Box::new(response)
                }))
            }
            Outcome::Refused => {
                conn.buffer_body(&mut response).await;
                conn.close().await;
                debug!(
                    status = %response.status,
                    connections = conn.opened(),
                    closed = conn.closed(),
                    "tunnel refused"
                );
                Err(e!(TunnelError::TunnelRefused {
                    response: Box::new(response)
                }))
            }
        }
    }
}

/// How a negotiation ended once no further attempt is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Established,
    Refused,
    AuthExhausted,
}

impl Outcome {
    fn of(status: StatusCode) -> Self {
        if status.is_success() {
            Outcome::Established
        } else if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            Outcome::AuthExhausted
        } else {
            Outcome::Refused
        }
    }
}

fn credentials_from_config(config: &TunnelConfig) -> Arc<dyn CredentialsProvider> {
    let mut provider = BasicCredentialsProvider::new();
    let Some(section) = &config.credentials else {
        return Arc::new(provider);
    };
    if !section.username.is_empty() {
        provider.set_credentials(AuthScope::ANY, Credentials::from(section));
    }
    if section.use_current_credentials {
        return current_user(provider);
    }
    Arc::new(provider)
}

#[cfg(windows)]
fn current_user(fallback: BasicCredentialsProvider) -> Arc<dyn CredentialsProvider> {
    Arc::new(SspiCredentialsProvider::with_fallback(fallback))
}

/// Rejected by [`TunnelConfig::validate`]; only reachable with an unvalidated config.
#[cfg(not(windows))]
fn current_user(fallback: BasicCredentialsProvider) -> Arc<dyn CredentialsProvider> {
    tracing::warn!("use_current_credentials is only supported on Windows");
    Arc::new(fallback)
}

/// An established tunnel.
///
/// Reads first yield any bytes the proxy sent after its `2xx` response head.
#[derive(derive_more::Debug)]
pub struct Tunnel {
    #[debug("{:?}", stream.get_ref().peer_addr().ok())]
    stream: Prebuffered<TcpStream>,
    response: HttpResponse,
}

impl Tunnel {
    /// The proxy's response to the final `CONNECT` request.
    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Splits the tunnel into the proxy response, the bytes already read past
    /// it and the raw connection.
    pub fn into_parts(self) -> (HttpResponse, Bytes, TcpStream) {
        let (buffered, stream) = self.stream.into_parts();
        (self.response, buffered, stream)
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialsConfig;

    #[test]
    fn outcome_by_status() {
        assert_eq!(Outcome::of(StatusCode::OK), Outcome::Established);
        assert_eq!(Outcome::of(StatusCode::CREATED), Outcome::Established);
        assert_eq!(
            Outcome::of(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            Outcome::AuthExhausted
        );
        assert_eq!(Outcome::of(StatusCode::BAD_GATEWAY), Outcome::Refused);
        assert_eq!(Outcome::of(StatusCode::MOVED_PERMANENTLY), Outcome::Refused);
    }

    #[test]
    fn config_credentials_apply_to_any_scope() {
        let config = TunnelConfig {
            credentials: Some(CredentialsConfig {
                username: "alice".into(),
                password: "secret".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let provider = credentials_from_config(&config);
        let found = provider
            .credentials(&AuthScope::new("proxy.example", 3128))
            .unwrap();
        assert_eq!(found.username(), "alice");
        assert_eq!(found.password(), "secret");

        let empty = credentials_from_config(&TunnelConfig::default());
        assert!(empty.credentials(&AuthScope::ANY).is_none());
    }

    #[tokio::test]
    async fn invalid_hosts_fail_before_io() {
        let client = ProxyClient::default();
        let target = HttpHost::http("example.com", 443);

        let err = client
            .tunnel(&HttpHost::new("http", "proxy", None), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidArgument { .. }));
        assert_eq!(err.response_status(), StatusCode::BAD_REQUEST);

        let err = client
            .tunnel(
                &HttpHost::http("127.0.0.1", 1),
                &HttpHost::new("http", "bad host", Some(443)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidArgument { .. }));
    }
}
