use std::{fmt::Debug, future::Future, time::Duration};

use http::{Version, header::CONNECTION};
use n0_error::e;
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, trace, warn};

use crate::{
    body::{self, BodySink},
    config::TunnelConfig,
    error::TunnelError,
    parse::{Authority, BodyFraming, ConnectRequest, HttpResponse, PROXY_CONNECTION},
    util::Prebuffered,
};

/// Decides whether the proxy connection may carry another request after a
/// response.
pub trait ReuseStrategy: Send + Sync + Debug {
    fn keep_alive(&self, request: &ConnectRequest, response: &HttpResponse) -> bool;
}

/// HTTP/1.x persistence rules (RFC 9112 §9.3), honouring the non-standard
/// `Proxy-Connection` header when `Connection` is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultReuseStrategy;

impl ReuseStrategy for DefaultReuseStrategy {
    fn keep_alive(&self, request: &ConnectRequest, response: &HttpResponse) -> bool {
        if request.wants_close() {
            return false;
        }
        if !response.body_framing().is_self_delimited() {
            return false;
        }
        let mut tokens: Vec<String> = response.header_tokens(&CONNECTION).collect();
        if tokens.is_empty() {
            tokens = response.header_tokens(&PROXY_CONNECTION).collect();
        }
        if tokens.iter().any(|token| token == "close") {
            return false;
        }
        if tokens.iter().any(|token| token == "keep-alive") {
            return true;
        }
        response.version != Version::HTTP_10 && response.version != Version::HTTP_09
    }
}

/// Opens a new connection for every attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReuse;

impl ReuseStrategy for NeverReuse {
    fn keep_alive(&self, _request: &ConnectRequest, _response: &HttpResponse) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,
    pub max_header_size: usize,
    pub max_buffered_body: usize,
}

impl From<&TunnelConfig> for ConnectionOptions {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
            max_header_size: config.max_header_size,
            max_buffered_body: config.max_buffered_body,
        }
    }
}

async fn with_timeout<T, E: From<io::Error>>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    match timeout {
        None => fut.await,
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for the proxy",
            )
            .into()),
        },
    }
}

/// The connection to the proxy used by one negotiation.
///
/// Opened lazily and reopened after it was closed. Any I/O failure closes it.
#[derive(derive_more::Debug)]
pub(crate) struct ProxyConnection {
    proxy: Authority,
    opts: ConnectionOptions,
    #[debug("{}", if stream.is_some() { "open" } else { "closed" })]
    stream: Option<Prebuffered<TcpStream>>,
    opened: u32,
    closed: u32,
}

impl ProxyConnection {
    pub(crate) fn new(proxy: Authority, opts: ConnectionOptions) -> Self {
        Self {
            proxy,
            opts,
            stream: None,
            opened: 0,
            closed: 0,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Number of TCP connections opened so far.
    pub(crate) fn opened(&self) -> u32 {
        self.opened
    }

    /// Number of TCP connections closed so far.
    pub(crate) fn closed(&self) -> u32 {
        self.closed
    }

    pub(crate) async fn ensure_open(&mut self) -> Result<(), TunnelError> {
        if self.is_open() {
            return Ok(());
        }
        let connect = async {
            tokio::time::timeout(
                self.opts.connect_timeout,
                TcpStream::connect(self.proxy.to_addr()),
            )
            .await
            .unwrap_or_else(|_elapsed| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out connecting to proxy",
                ))
            })
        };
        let stream = connect.await.map_err(|source| {
            e!(TunnelError::ProxyConnect {
                proxy: self.proxy.clone(),
                source,
            })
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {err:#}");
        }
        self.opened += 1;
        debug!(proxy = %self.proxy, opened = self.opened, "connected to proxy");
        self.stream = Some(Prebuffered::new(stream, self.opts.max_header_size));
        Ok(())
    }

    /// Sends `request` and reads the response head, opening the connection
    /// first if needed.
    pub(crate) async fn execute(
        &mut self,
        request: &ConnectRequest,
    ) -> Result<HttpResponse, TunnelError> {
        self.ensure_open().await?;
        let res = self.round_trip(request).await;
        if res.is_err() {
            self.close().await;
        }
        res
    }

    async fn round_trip(&mut self, request: &ConnectRequest) -> Result<HttpResponse, TunnelError> {
        let timeout = self.opts.socket_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        with_timeout(timeout, request.write(stream)).await?;
        let response = with_timeout(timeout, HttpResponse::read(stream)).await?;
        trace!(%response, buffered = stream.buffer().len(), "received response head");
        Ok(response)
    }

    /// Discards the body of `response` so the connection can be reused.
    ///
    /// Bodies that are only delimited by the connection closing cannot be
    /// skipped; the connection is closed instead.
    pub(crate) async fn drain_body(&mut self, response: &HttpResponse) -> Result<(), TunnelError> {
        let framing = response.body_framing();
        if !framing.is_self_delimited() {
            debug!(?framing, "response body is not self-delimited, closing connection");
            self.close().await;
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let res = with_timeout(
            self.opts.socket_timeout,
            body::read_body(stream, framing, &mut BodySink::discard()),
        )
        .await;
        if let Err(err) = res {
            self.close().await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Reads the body of a final response into `response.body`.
    ///
    /// Best effort: read failures are logged and whatever was received is kept.
    pub(crate) async fn buffer_body(&mut self, response: &mut HttpResponse) {
        let framing = response.body_framing();
        let mut sink = BodySink::collect(self.opts.max_buffered_body);
        if let Some(stream) = self.stream.as_mut()
            && framing != BodyFraming::Empty
        {
            let res =
                with_timeout(self.opts.socket_timeout, body::read_body(stream, framing, &mut sink))
                    .await;
            if let Err(err) = res {
                debug!(status = %response.status, "failed to read response body: {err:#}");
            }
        }
        if sink.is_truncated() {
            warn!(
                limit = self.opts.max_buffered_body,
                received = sink.total(),
                "response body truncated"
            );
        }
        response.body = Some(sink.into_bytes());
    }

    /// Closes the connection. Closing a closed connection does nothing.
    pub(crate) async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                trace!("shutdown failed: {err:#}");
            }
            self.closed += 1;
            debug!(proxy = %self.proxy, closed = self.closed, "closed proxy connection");
        }
    }

    /// Hands the open connection over, e.g. to become a tunnel.
    pub(crate) fn into_stream(mut self) -> Option<Prebuffered<TcpStream>> {
        self.stream.take()
    }
}
