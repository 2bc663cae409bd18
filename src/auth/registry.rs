use serde::{Deserialize, Serialize};

use super::{
    AuthError, AuthScheme, basic::BasicScheme, challenge::AuthChallenge, digest::DigestScheme,
    negotiate::NegotiateScheme, ntlm::NtlmScheme,
};
use crate::{
    config::HeaderCharset,
    credentials::{AuthScope, CredentialsProvider},
    parse::Authority,
};

/// Proxy authentication schemes known to the crate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize,
)]
pub enum AuthSchemeKind {
    /// SPNEGO, advertised as `Negotiate`.
    #[display("Negotiate")]
    #[serde(rename = "Negotiate", alias = "negotiate", alias = "SPNEGO", alias = "spnego")]
    Spnego,
    #[serde(alias = "kerberos")]
    Kerberos,
    #[serde(alias = "digest")]
    Digest,
    #[display("NTLM")]
    #[serde(rename = "NTLM", alias = "ntlm")]
    Ntlm,
    #[serde(alias = "basic")]
    Basic,
}

impl AuthSchemeKind {
    /// Schemes from most to least preferred.
    pub const PREFERENCE: [AuthSchemeKind; 5] = [
        AuthSchemeKind::Spnego,
        AuthSchemeKind::Kerberos,
        AuthSchemeKind::Digest,
        AuthSchemeKind::Ntlm,
        AuthSchemeKind::Basic,
    ];

    /// Scheme name as it appears in `Proxy-Authenticate`.
    pub fn challenge_name(self) -> &'static str {
        match self {
            AuthSchemeKind::Spnego => "Negotiate",
            AuthSchemeKind::Kerberos => "Kerberos",
            AuthSchemeKind::Digest => "Digest",
            AuthSchemeKind::Ntlm => "NTLM",
            AuthSchemeKind::Basic => "Basic",
        }
    }

    /// Scheme name used as prefix of the `Proxy-Authorization` value.
    ///
    /// Kerberos tokens are sent as `Negotiate` as well.
    pub fn header_prefix(self) -> &'static str {
        match self {
            AuthSchemeKind::Kerberos => "Negotiate",
            other => other.challenge_name(),
        }
    }

    pub fn from_challenge_name(name: &str) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|kind| kind.challenge_name().eq_ignore_ascii_case(name))
    }
}

/// The set of schemes a [`ProxyClient`](crate::ProxyClient) may answer with.
///
/// Immutable once built; shared by all negotiations of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSchemeRegistry {
    schemes: Vec<AuthSchemeKind>,
}

impl Default for AuthSchemeRegistry {
    fn default() -> Self {
        Self::new(AuthSchemeKind::PREFERENCE)
    }
}

impl AuthSchemeRegistry {
    pub fn new(schemes: impl IntoIterator<Item = AuthSchemeKind>) -> Self {
        let mut list = Vec::new();
        for kind in schemes {
            if !list.contains(&kind) {
                list.push(kind);
            }
        }
        Self { schemes: list }
    }

    pub fn schemes(&self) -> &[AuthSchemeKind] {
        &self.schemes
    }

    pub fn supports(&self, kind: AuthSchemeKind) -> bool {
        self.schemes.contains(&kind)
    }

    /// Looks up an enabled scheme by its challenge name, case-insensitively.
    pub fn lookup(&self, name: &str) -> Option<AuthSchemeKind> {
        AuthSchemeKind::from_challenge_name(name).filter(|kind| self.supports(*kind))
    }

    /// Instantiates a handler for `kind` and feeds it its first challenge.
    ///
    /// Returns `Ok(None)` if the scheme is disabled or no credentials are
    /// available for it.
    pub(crate) fn create(
        &self,
        kind: AuthSchemeKind,
        challenge: &AuthChallenge,
        provider: &dyn CredentialsProvider,
        proxy: &Authority,
        charset: HeaderCharset,
    ) -> Result<Option<AuthScheme>, AuthError> {
        if !self.supports(kind) {
            return Ok(None);
        }
        let scope = AuthScope {
            realm: challenge.param("realm").map(ToOwned::to_owned),
            scheme: Some(kind),
            ..AuthScope::for_proxy(proxy)
        };
        let mut scheme = match kind {
            AuthSchemeKind::Basic => provider
                .credentials(&scope)
                .map(|credentials| AuthScheme::Basic(BasicScheme::new(credentials, charset))),
            AuthSchemeKind::Digest => provider
                .credentials(&scope)
                .map(|credentials| AuthScheme::Digest(DigestScheme::new(credentials, charset))),
            AuthSchemeKind::Ntlm => match provider.credentials(&scope) {
                Some(credentials) => Some(AuthScheme::Ntlm(NtlmScheme::new(credentials))),
                None => provider
                    .security_context(kind, proxy)
                    .map(|context| AuthScheme::Ntlm(NtlmScheme::with_context(context))),
            },
            AuthSchemeKind::Spnego | AuthSchemeKind::Kerberos => provider
                .security_context(kind, proxy)
                .map(|context| AuthScheme::Negotiate(NegotiateScheme::new(kind, context))),
        };
        if let Some(scheme) = scheme.as_mut() {
            scheme.process_challenge(challenge)?;
        }
        Ok(scheme)
    }
}
