//! HTTP `CONNECT` tunnels through authenticating forward proxies.
//!
//! [`ProxyClient::tunnel`] sends `CONNECT host:port` to a proxy, answers
//! `407 Proxy Authentication Required` challenges with Basic, Digest, NTLM,
//! SPNEGO or Kerberos, and returns the raw connection once the proxy accepts.
//!
//! ```no_run
//! # async fn run() -> Result<(), connect_tunnel::TunnelError> {
//! use connect_tunnel::{BasicCredentialsProvider, Credentials, HttpHost, ProxyClient, TunnelConfig};
//!
//! let credentials = BasicCredentialsProvider::with_credentials(Credentials::new("alice", "secret"));
//! let client = ProxyClient::new(TunnelConfig::default(), credentials);
//! let tunnel = client
//!     .tunnel(&HttpHost::http("proxy.corp", 3128), &HttpHost::http("example.com", 443))
//!     .await?;
//! # drop(tunnel);
//! # Ok(())
//! # }
//! ```

mod auth;
mod body;
mod client;
mod config;
mod connection;
mod credentials;
mod error;
mod parse;
mod util;

#[cfg(windows)]
pub use auth::SspiCredentialsProvider;
pub use {
    auth::{
        AuthChallenge, AuthExchange, AuthSchemeKind, AuthSchemeRegistry, AuthState,
        ChallengeHandler, parse_challenges,
    },
    client::{ProxyClient, Tunnel},
    config::{CredentialsConfig, HeaderCharset, TunnelConfig},
    connection::{DefaultReuseStrategy, NeverReuse, ReuseStrategy},
    credentials::{
        AuthScope, BasicCredentialsProvider, Credentials, CredentialsProvider, SecurityContext,
    },
    error::TunnelError,
    parse::{
        Authority, BodyFraming, ConnectRequest, DEFAULT_TARGET_PORT, HttpHost, HttpResponse,
        PROXY_CONNECTION,
    },
};

#[cfg(test)]
mod tests;
