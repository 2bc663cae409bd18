use std::{path::Path, time::Duration};

use n0_error::{Result, StdResultExt, ensure_any};
use serde::{Deserialize, Serialize};

use crate::auth::AuthSchemeKind;

/// Character encoding used for header values that are not plain ASCII.
///
/// Applies to decoding `Proxy-Authenticate` challenges and to encoding
/// credentials into `Proxy-Authorization` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeaderCharset {
    /// ISO-8859-1, the historical HTTP/1.1 default.
    #[default]
    #[serde(rename = "iso-8859-1", alias = "latin1")]
    Latin1,
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
}

impl HeaderCharset {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            HeaderCharset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            HeaderCharset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Characters that do not fit into ISO-8859-1 are replaced by `?`.
    pub fn encode(self, s: &str) -> Vec<u8> {
        match self {
            HeaderCharset::Latin1 => s
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            HeaderCharset::Utf8 => s.as_bytes().to_vec(),
        }
    }
}

/// Credentials section of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
    /// NT domain for NTLM. May also be given as `DOMAIN\user` in `username`.
    pub domain: Option<String>,
    pub workstation: Option<String>,
    /// Use the logon session of the current Windows user for Negotiate,
    /// Kerberos and NTLM (SSPI). Windows only.
    pub use_current_credentials: bool,
}

/// Tunnel negotiation settings.
///
/// Timeouts are in seconds; `0` disables the respective timeout (except for
/// `connect_timeout`, which must be positive).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub connect_timeout: u64,
    /// Upper bound for each individual read from the proxy.
    pub socket_timeout: u64,
    /// Upper bound for a whole `tunnel` call, all round trips included.
    pub request_timeout: u64,
    /// Maximum size of a response status line plus header section.
    pub max_header_size: usize,
    /// Maximum number of body bytes kept from a refusal response.
    pub max_buffered_body: usize,
    pub header_charset: HeaderCharset,
    pub user_agent: Option<String>,
    /// Maximum number of challenge answers per negotiation.
    pub max_auth_rounds: u32,
    /// Authentication schemes that may be used to answer proxy challenges.
    pub auth_schemes: Vec<AuthSchemeKind>,
    pub credentials: Option<CredentialsConfig>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            socket_timeout: 30,
            request_timeout: 0,
            max_header_size: 8192,
            max_buffered_body: 64 * 1024,
            header_charset: HeaderCharset::default(),
            user_agent: None,
            max_auth_rounds: 8,
            auth_schemes: AuthSchemeKind::PREFERENCE.to_vec(),
            credentials: None,
        }
    }
}

impl TunnelConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).std_context("failed to read configuration file")?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates a TOML configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TunnelConfig = toml::from_str(content).std_context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_any!(self.connect_timeout > 0, "connect_timeout must be positive");
        ensure_any!(self.max_header_size >= 64, "max_header_size must be at least 64 bytes");
        ensure_any!(self.max_auth_rounds > 0, "max_auth_rounds must be positive");
        ensure_any!(self.max_buffered_body > 0, "max_buffered_body must be positive");
        if let Some(credentials) = &self.credentials {
            ensure_any!(
                !credentials.use_current_credentials || cfg!(windows),
                "use_current_credentials is only supported on Windows"
            );
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout > 0).then(|| Duration::from_secs(self.socket_timeout))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout > 0).then(|| Duration::from_secs(self.request_timeout))
    }
}
