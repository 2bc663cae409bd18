use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use http::StatusCode;
use n0_error::{AnyError, Result, StackResultExt, StdResultExt};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::{
    AuthSchemeKind, AuthSchemeRegistry, AuthScope, Authority, BasicCredentialsProvider, Credentials,
    CredentialsProvider, HttpHost, NeverReuse, ProxyClient, SecurityContext, TunnelConfig,
    TunnelError,
};

// -- Scripted proxy --

/// A request head as received by the scripted proxy.
#[derive(Debug, Clone)]
struct Seen {
    /// Index of the request across all connections.
    index: usize,
    /// Index of the TCP connection the request arrived on.
    conn: usize,
    request_line: String,
    authorization: Option<String>,
}

impl Seen {
    fn parse(index: usize, conn: usize, head: &str) -> Self {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let authorization = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("proxy-authorization"))
            .map(|(_, value)| value.trim().to_string());
        Self {
            index,
            conn,
            request_line,
            authorization,
        }
    }

    fn auth(&self) -> &str {
        self.authorization.as_deref().unwrap_or_default()
    }
}

enum Reply {
    /// Write the raw response; close the connection afterwards if `close`.
    Respond { raw: String, close: bool },
    /// Write the raw response and echo everything the client sends.
    Tunnel { raw: String },
    /// Never answer.
    Silence,
}

fn respond(raw: &str) -> Reply {
    Reply::Respond {
        raw: raw.to_string(),
        close: false,
    }
}

fn respond_and_close(raw: &str) -> Reply {
    Reply::Respond {
        raw: raw.to_string(),
        close: true,
    }
}

const ESTABLISHED: &str = "HTTP/1.1 200 Connection established\r\n\r\n";

type Script = dyn Fn(&Seen) -> Reply + Send + Sync;

/// An in-process proxy that answers each request head via a script.
struct ScriptedProxy {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
    closed: watch::Receiver<usize>,
    _task: AbortOnDropHandle<()>,
}

impl ScriptedProxy {
    async fn spawn(script: impl Fn(&Seen) -> Reply + Send + Sync + 'static) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, closed) = watch::channel(0);
        let closed_tx = Arc::new(closed_tx);
        let script: Arc<Script> = Arc::new(script);
        let task = tokio::spawn({
            let seen = seen.clone();
            async move {
                let mut conn = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    let (script, seen, closed_tx) = (script.clone(), seen.clone(), closed_tx.clone());
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream, conn, &*script, &seen).await {
                            debug!("scripted proxy connection failed: {err:#}");
                        }
                        closed_tx.send_modify(|n| *n += 1);
                    });
                    conn += 1;
                }
            }
        });
        Ok(Self {
            addr,
            seen,
            closed,
            _task: AbortOnDropHandle::new(task),
        })
    }

    fn host(&self) -> HttpHost {
        HttpHost::http("127.0.0.1", self.addr.port())
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Waits until the proxy observed `n` connections ending.
    async fn wait_closed(&mut self, n: usize) -> Result<()> {
        self.closed
            .wait_for(|closed| *closed >= n)
            .timeout(Duration::from_secs(3))
            .await
            .std_context("timed out waiting for connections to close")?
            .std_context("proxy task ended")?;
        Ok(())
    }
}

async fn serve(
    mut stream: TcpStream,
    conn: usize,
    script: &Script,
    seen: &Mutex<Vec<Seen>>,
) -> Result<()> {
    let mut buf = Vec::new();
    while let Some(head) = read_head(&mut stream, &mut buf).await? {
        let request = {
            let mut seen = seen.lock().unwrap();
            let request = Seen::parse(seen.len(), conn, &head);
            seen.push(request.clone());
            request
        };
        debug!(conn, line = %request.request_line, auth = ?request.authorization, "scripted proxy got request");
        match script(&request) {
            Reply::Respond { raw, close } => {
                stream.write_all(raw.as_bytes()).await?;
                if close {
                    stream.shutdown().await?;
                    return Ok(());
                }
            }
            Reply::Tunnel { raw } => {
                stream.write_all(raw.as_bytes()).await?;
                stream.write_all(&buf).await?;
                let (mut recv, mut send) = stream.split();
                tokio::io::copy(&mut recv, &mut send).await?;
                return Ok(());
            }
            Reply::Silence => std::future::pending::<()>().await,
        }
    }
    Ok(())
}

/// Reads one request head, leaving anything after it in `buf`.
async fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Option<String>> {
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head: Vec<u8> = buf.drain(..end + 4).collect();
            return Ok(Some(String::from_utf8_lossy(&head).into_owned()));
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

// -- Helpers --

fn target() -> HttpHost {
    HttpHost::http("example.com", 443)
}

fn alice() -> BasicCredentialsProvider {
    BasicCredentialsProvider::with_credentials(Credentials::new("alice", "secret"))
}

fn client(credentials: impl CredentialsProvider + 'static) -> ProxyClient {
    ProxyClient::new(TunnelConfig::default(), credentials)
}

fn client_with(config: TunnelConfig, credentials: impl CredentialsProvider + 'static) -> ProxyClient {
    ProxyClient::new(config, credentials)
}

// -- Basic flow --

#[tokio::test]
#[traced_test]
async fn basic_auth_takes_two_round_trips() -> Result {
    let proxy = ScriptedProxy::spawn(|req| match req.auth() {
        "" => respond(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 6\r\n\r\ndenied",
        ),
        "Basic YWxpY2U6c2VjcmV0" => respond(ESTABLISHED),
        _ => respond_and_close("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n"),
    })
    .await?;

    let tunnel = client(alice()).tunnel(&proxy.host(), &target()).await?;
    assert_eq!(tunnel.response().status, StatusCode::OK);

    let seen = proxy.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].request_line, "CONNECT example.com:443 HTTP/1.1");
    assert_eq!(seen[0].authorization, None);
    assert_eq!(seen[1].auth(), "Basic YWxpY2U6c2VjcmV0");
    // the 407 body was drained and the connection reused
    assert_eq!(seen[1].conn, seen[0].conn);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn digest_is_preferred_over_basic() -> Result {
    let proxy = ScriptedProxy::spawn(|req| {
        if req.auth().is_empty() {
            respond(
                "HTTP/1.1 407 Proxy Authentication Required\r\n\
                 Proxy-Authenticate: Basic realm=\"corp\"\r\n\
                 Proxy-Authenticate: Digest realm=\"corp\", nonce=\"abc\", qop=\"auth\"\r\n\
                 Content-Length: 0\r\n\r\n",
            )
        } else {
            respond(ESTABLISHED)
        }
    })
    .await?;

    client(alice()).tunnel(&proxy.host(), &target()).await?;

    let seen = proxy.seen();
    assert_eq!(seen.len(), 2);
    let auth = seen[1].auth();
    assert!(auth.starts_with("Digest "), "{auth}");
    assert!(auth.contains("username=\"alice\""));
    assert!(auth.contains("uri=\"example.com:443\""));
    assert!(auth.contains("nc=00000001"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn unsupported_schemes_exhaust_after_first_challenge() -> Result {
    let proxy = ScriptedProxy::spawn(|_| {
        respond(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Bearer realm=\"corp\"\r\nContent-Length: 11\r\n\r\nneed bearer",
        )
    })
    .await?;

    let err = client(alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    let TunnelError::AuthExhausted { response, .. } = &err else {
        panic!("expected AuthExhausted, got {err:?}");
    };
    assert_eq!(response.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(response.body.as_deref(), Some(&b"need bearer"[..]));
    assert_eq!(proxy.seen().len(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn missing_credentials_leave_challenge_unanswered() -> Result {
    let proxy = ScriptedProxy::spawn(|_| {
        respond(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
        )
    })
    .await?;

    let err = ProxyClient::default()
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AuthExhausted { .. }));
    assert_eq!(err.response_status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(proxy.seen().len(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn rejected_credentials_terminate() -> Result {
    let proxy = ScriptedProxy::spawn(|_| {
        respond(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
        )
    })
    .await?;

    let err = client(alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AuthExhausted { .. }));
    let seen = proxy.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].auth(), "Basic YWxpY2U6c2VjcmV0");
    Ok(())
}

// -- Final responses --

#[tokio::test]
#[traced_test]
async fn refusal_keeps_body_and_closes_connection() -> Result {
    let mut proxy = ScriptedProxy::spawn(|_| {
        respond("HTTP/1.1 502 Bad Gateway\r\nContent-Length: 13\r\n\r\nupstream down")
    })
    .await?;

    let err = client(alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    assert!(err.is_refusal());
    let TunnelError::TunnelRefused { response, .. } = &err else {
        panic!("expected TunnelRefused, got {err:?}");
    };
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(response.body.as_deref(), Some(&b"upstream down"[..]));
    assert_eq!(err.response_status(), StatusCode::BAD_GATEWAY);
    proxy.wait_closed(1).await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn refusal_with_many_headers_is_parsed() -> Result {
    let proxy = ScriptedProxy::spawn(|_| {
        let mut raw = String::from("HTTP/1.1 502 Bad Gateway\r\n");
        for i in 0..70 {
            raw.push_str(&format!("Via: 1.1 hop{i}\r\n"));
        }
        raw.push_str("Content-Length: 2\r\n\r\nno");
        respond(&raw)
    })
    .await?;

    let err = client(alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    let TunnelError::TunnelRefused { response, .. } = &err else {
        panic!("expected TunnelRefused, got {err:?}");
    };
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers.get_all("via").iter().count(), 70);
    assert_eq!(response.body.as_deref(), Some(&b"no"[..]));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn refusal_body_until_close_is_buffered() -> Result {
    let proxy = ScriptedProxy::spawn(|_| {
        respond_and_close("HTTP/1.0 403 Forbidden\r\n\r\nblocked by policy")
    })
    .await?;

    let err = client(alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    let response = err.response().context("refusal without response")?;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.body.as_deref(), Some(&b"blocked by policy"[..]));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn informational_response_is_unexpected() -> Result {
    let proxy = ScriptedProxy::spawn(|_| respond("HTTP/1.1 100 Continue\r\n\r\n")).await?;

    let err = client(alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::UnexpectedResponse { status, .. } if status == StatusCode::CONTINUE
    ));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn tunnel_relays_bytes_sent_with_response() -> Result {
    let proxy = ScriptedProxy::spawn(|_| Reply::Tunnel {
        raw: format!("{ESTABLISHED}hello"),
    })
    .await?;

    let mut tunnel = client(alice()).tunnel(&proxy.host(), &target()).await?;
    let mut buf = [0u8; 5];
    tunnel
        .read_exact(&mut buf)
        .timeout(Duration::from_secs(3))
        .await
        .anyerr()??;
    assert_eq!(&buf, b"hello");

    tunnel.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    tunnel
        .read_exact(&mut buf)
        .timeout(Duration::from_secs(3))
        .await
        .anyerr()??;
    assert_eq!(&buf, b"ping");

    let (response, buffered, _stream) = tunnel.into_parts();
    assert_eq!(response.status, StatusCode::OK);
    assert!(buffered.is_empty());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn target_without_port_uses_port_80() -> Result {
    let proxy = ScriptedProxy::spawn(|_| respond(ESTABLISHED)).await?;

    let target = HttpHost::new("http", "example.com", None);
    client(alice()).tunnel(&proxy.host(), &target).await?;
    assert_eq!(
        proxy.seen()[0].request_line,
        "CONNECT example.com:80 HTTP/1.1"
    );
    Ok(())
}

// -- Connection reuse --

#[tokio::test]
#[traced_test]
async fn connection_close_opens_new_connection() -> Result {
    let mut proxy = ScriptedProxy::spawn(|req| match req.auth() {
        "" => respond_and_close(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        ),
        _ => respond(ESTABLISHED),
    })
    .await?;

    client(alice()).tunnel(&proxy.host(), &target()).await?;
    let seen = proxy.seen();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0].conn, seen[1].conn);
    proxy.wait_closed(1).await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn never_reuse_closes_before_retry() -> Result {
    let mut proxy = ScriptedProxy::spawn(|req| match req.auth() {
        "" => respond(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
        ),
        _ => respond(ESTABLISHED),
    })
    .await?;

    let client = client(alice()).with_reuse_strategy(NeverReuse);
    let _tunnel = client.tunnel(&proxy.host(), &target()).await?;
    let seen = proxy.seen();
    assert_eq!((seen[0].conn, seen[1].conn), (0, 1));
    // the first connection is closed exactly once; the tunnel stays open
    proxy.wait_closed(1).await?;
    assert_eq!(*proxy.closed.borrow(), 1);
    Ok(())
}

// -- Multi-leg schemes --

fn ntlm_challenge_message() -> String {
    let target_info = [0u8; 4];
    let mut msg = b"NTLMSSP\0".to_vec();
    msg.extend(2u32.to_le_bytes());
    msg.extend([0u8; 8]);
    msg.extend(0x0082_8205u32.to_le_bytes());
    msg.extend([1, 2, 3, 4, 5, 6, 7, 8]);
    msg.extend([0u8; 8]);
    msg.extend((target_info.len() as u16).to_le_bytes());
    msg.extend((target_info.len() as u16).to_le_bytes());
    msg.extend(48u32.to_le_bytes());
    msg.extend(target_info);
    STANDARD.encode(msg)
}

fn ntlm_message_type(auth: &str) -> Option<u32> {
    let token = STANDARD.decode(auth.strip_prefix("NTLM ")?).ok()?;
    if !token.starts_with(b"NTLMSSP\0") {
        return None;
    }
    Some(u32::from_le_bytes(token.get(8..12)?.try_into().ok()?))
}

#[tokio::test]
#[traced_test]
async fn ntlm_handshake_uses_one_connection() -> Result {
    let proxy = ScriptedProxy::spawn(|req| match ntlm_message_type(req.auth()) {
        None => respond(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
        ),
        Some(1) => respond(&format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM {}\r\nContent-Length: 0\r\n\r\n",
            ntlm_challenge_message()
        )),
        Some(3) => respond(ESTABLISHED),
        Some(_) => respond_and_close("HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n"),
    })
    .await?;

    let credentials = BasicCredentialsProvider::with_credentials(Credentials::new(
        "CORP\\alice",
        "secret",
    ));
    client(credentials).tunnel(&proxy.host(), &target()).await?;

    let seen = proxy.seen();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|req| req.conn == 0));
    assert_eq!(ntlm_message_type(seen[1].auth()), Some(1));
    assert_eq!(ntlm_message_type(seen[2].auth()), Some(3));
    Ok(())
}

/// Produces `leg1`, `leg2`, ... and records the tokens it was given.
#[derive(Debug, Default)]
struct CountingContext {
    legs: usize,
    inputs: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
}

impl SecurityContext for CountingContext {
    fn step(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, AnyError> {
        self.inputs.lock().unwrap().push(input.map(<[u8]>::to_vec));
        self.legs += 1;
        Ok(format!("leg{}", self.legs).into_bytes())
    }
}

#[derive(Debug, Default)]
struct FakeGss {
    inputs: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
}

impl CredentialsProvider for FakeGss {
    fn credentials(&self, _scope: &AuthScope) -> Option<Credentials> {
        None
    }

    fn security_context(
        &self,
        scheme: AuthSchemeKind,
        proxy: &Authority,
    ) -> Option<Box<dyn SecurityContext>> {
        assert_eq!(proxy.host, "127.0.0.1");
        matches!(scheme, AuthSchemeKind::Spnego).then(|| {
            Box::new(CountingContext {
                legs: 0,
                inputs: self.inputs.clone(),
            }) as Box<dyn SecurityContext>
        })
    }
}

#[tokio::test]
#[traced_test]
async fn spnego_continues_while_proxy_sends_tokens() -> Result {
    let leg1 = format!("Negotiate {}", STANDARD.encode("leg1"));
    let leg2 = format!("Negotiate {}", STANDARD.encode("leg2"));
    let proxy = ScriptedProxy::spawn(move |req| {
        if req.auth() == leg1 {
            respond(&format!(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate {}\r\nContent-Length: 0\r\n\r\n",
                STANDARD.encode("server1")
            ))
        } else if req.auth() == leg2 {
            respond(ESTABLISHED)
        } else {
            respond(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
            )
        }
    })
    .await?;

    let gss = FakeGss::default();
    let inputs = gss.inputs.clone();
    client(gss).tunnel(&proxy.host(), &target()).await?;

    assert_eq!(proxy.seen().len(), 3);
    assert_eq!(
        *inputs.lock().unwrap(),
        vec![None, Some(b"server1".to_vec())]
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn digest_stale_nonce_is_retried() -> Result {
    let proxy = ScriptedProxy::spawn(|req| {
        let auth = req.auth();
        if auth.contains("nonce=\"n2\"") {
            respond(ESTABLISHED)
        } else if auth.contains("nonce=\"n1\"") {
            respond(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Digest realm=\"corp\", nonce=\"n2\", qop=\"auth\", stale=true\r\nContent-Length: 0\r\n\r\n",
            )
        } else {
            respond(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Digest realm=\"corp\", nonce=\"n1\", qop=\"auth\"\r\nContent-Length: 0\r\n\r\n",
            )
        }
    })
    .await?;

    client(alice()).tunnel(&proxy.host(), &target()).await?;
    let seen = proxy.seen();
    assert_eq!(seen.len(), 3);
    assert!(seen[2].auth().contains("nc=00000001"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn auth_rounds_are_bounded() -> Result {
    let proxy = ScriptedProxy::spawn(|req| {
        respond(&format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Digest realm=\"corp\", nonce=\"n{}\", stale=true\r\nContent-Length: 0\r\n\r\n",
            req.index
        ))
    })
    .await?;

    let config = TunnelConfig {
        max_auth_rounds: 2,
        ..Default::default()
    };
    let err = client_with(config, alice())
        .tunnel(&proxy.host(), &target())
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AuthExhausted { .. }));
    assert_eq!(proxy.seen().len(), 3);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn disabled_schemes_are_ignored() -> Result {
    let proxy = ScriptedProxy::spawn(|req| {
        if req.auth().starts_with("Basic ") {
            respond(ESTABLISHED)
        } else {
            respond(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Digest realm=\"corp\", nonce=\"abc\"\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
            )
        }
    })
    .await?;

    let client = client(alice()).with_registry(AuthSchemeRegistry::new([AuthSchemeKind::Basic]));
    client.tunnel(&proxy.host(), &target()).await?;
    assert_eq!(proxy.seen().len(), 2);
    Ok(())
}

// -- Timeouts --

#[tokio::test]
#[traced_test]
async fn request_timeout_bounds_negotiation() -> Result {
    let proxy = ScriptedProxy::spawn(|_| Reply::Silence).await?;

    let config = TunnelConfig {
        socket_timeout: 0,
        request_timeout: 1,
        ..Default::default()
    };
    let err = client_with(config, alice())
        .tunnel(&proxy.host(), &target())
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()?
        .unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(err.response_status(), StatusCode::GATEWAY_TIMEOUT);
    Ok(())
}
