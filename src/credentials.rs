use std::fmt;

use n0_error::AnyError;

use crate::{auth::AuthSchemeKind, config::CredentialsConfig, parse::Authority};

/// User credentials handed to an authentication scheme.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    UsernamePassword {
        username: String,
        password: String,
    },
    /// Windows NT credentials for NTLM.
    Nt {
        username: String,
        password: String,
        domain: Option<String>,
        workstation: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Nt {
                username,
                domain,
                workstation,
                ..
            } => f
                .debug_struct("Nt")
                .field("username", username)
                .field("domain", domain)
                .field("workstation", workstation)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::UsernamePassword {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn nt(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: Option<String>,
        workstation: Option<String>,
    ) -> Self {
        Credentials::Nt {
            username: username.into(),
            password: password.into(),
            domain,
            workstation,
        }
    }

    /// The user name as configured, including any `DOMAIN\` prefix.
    pub fn username(&self) -> &str {
        match self {
            Credentials::UsernamePassword { username, .. } | Credentials::Nt { username, .. } => {
                username
            }
        }
    }

    pub fn password(&self) -> &str {
        match self {
            Credentials::UsernamePassword { password, .. } | Credentials::Nt { password, .. } => {
                password
            }
        }
    }

    /// Splits the credentials into NT form: user, domain and workstation.
    ///
    /// A `DOMAIN\user` user name is split when no explicit domain is set.
    pub(crate) fn nt_identity(&self) -> NtIdentity<'_> {
        let (username, domain, workstation) = match self {
            Credentials::UsernamePassword { username, .. } => (username.as_str(), None, None),
            Credentials::Nt {
                username,
                domain,
                workstation,
                ..
            } => (username.as_str(), domain.as_deref(), workstation.as_deref()),
        };
        match (domain, username.split_once('\\')) {
            (None, Some((domain, user))) => NtIdentity {
                user,
                domain,
                workstation: workstation.unwrap_or_default(),
            },
            (domain, _) => NtIdentity {
                user: username,
                domain: domain.unwrap_or_default(),
                workstation: workstation.unwrap_or_default(),
            },
        }
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(config: &CredentialsConfig) -> Self {
        if config.domain.is_some() || config.workstation.is_some() {
            Credentials::nt(
                config.username.clone(),
                config.password.clone(),
                config.domain.clone(),
                config.workstation.clone(),
            )
        } else {
            Credentials::new(config.username.clone(), config.password.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NtIdentity<'a> {
    pub user: &'a str,
    pub domain: &'a str,
    pub workstation: &'a str,
}

/// Describes what a set of credentials applies to.
///
/// `None` fields act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthScope {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub realm: Option<String>,
    pub scheme: Option<AuthSchemeKind>,
}

impl AuthScope {
    /// Matches every proxy, realm and scheme.
    pub const ANY: AuthScope = AuthScope {
        host: None,
        port: None,
        realm: None,
        scheme: None,
    };

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    pub(crate) fn for_proxy(proxy: &Authority) -> Self {
        Self::new(proxy.host.clone(), proxy.port)
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_scheme(mut self, scheme: AuthSchemeKind) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Scores how well `self` (a stored scope) matches `requested`.
    ///
    /// Returns `None` if the scopes are incompatible. Higher is more specific.
    pub fn match_score(&self, requested: &AuthScope) -> Option<u32> {
        fn part<T: PartialEq>(
            stored: &Option<T>,
            requested: &Option<T>,
            eq: impl Fn(&T, &T) -> bool,
            weight: u32,
        ) -> Option<u32> {
            match (stored, requested) {
                (None, _) => Some(0),
                (Some(a), Some(b)) if eq(a, b) => Some(weight),
                (Some(_), None) => Some(0),
                _ => None,
            }
        }
        Some(
            part(&self.scheme, &requested.scheme, PartialEq::eq, 1)?
                + part(&self.realm, &requested.realm, PartialEq::eq, 2)?
                + part(&self.port, &requested.port, PartialEq::eq, 4)?
                + part(
                    &self.host,
                    &requested.host,
                    |a: &String, b: &String| a.eq_ignore_ascii_case(b),
                    8,
                )?,
        )
    }
}

/// A GSS-API style security context producing SPNEGO, Kerberos or NTLM tokens.
pub trait SecurityContext: Send {
    /// Produces the next output token, given the proxy's last token if any.
    fn step(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, AnyError>;
}

/// Source of credentials for answering proxy challenges.
pub trait CredentialsProvider: Send + Sync + fmt::Debug {
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials>;

    /// Returns a fresh security context for token based schemes.
    fn security_context(
        &self,
        _scheme: AuthSchemeKind,
        _proxy: &Authority,
    ) -> Option<Box<dyn SecurityContext>> {
        None
    }
}

/// In-memory credentials keyed by [`AuthScope`].
///
/// The default value holds no credentials and leaves every challenge unanswered.
#[derive(Debug, Clone, Default)]
pub struct BasicCredentialsProvider {
    entries: Vec<(AuthScope, Credentials)>,
}

impl BasicCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that returns `credentials` for any scope.
    pub fn with_credentials(credentials: Credentials) -> Self {
        let mut provider = Self::new();
        provider.set_credentials(AuthScope::ANY, credentials);
        provider
    }

    /// Stores credentials, replacing an entry with an identical scope.
    pub fn set_credentials(&mut self, scope: AuthScope, credentials: Credentials) {
        match self.entries.iter_mut().find(|(s, _)| *s == scope) {
            Some(entry) => entry.1 = credentials,
            None => self.entries.push((scope, credentials)),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl CredentialsProvider for BasicCredentialsProvider {
    /// Picks the highest scoring entry; on ties the one stored first.
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials> {
        let mut best: Option<(u32, &Credentials)> = None;
        for (stored, credentials) in &self.entries {
            let Some(score) = stored.match_score(scope) else {
                continue;
            };
            if best.is_none_or(|(best_score, _)| score > best_score) {
                best = Some((score, credentials));
            }
        }
        best.map(|(_, credentials)| credentials.clone())
    }
}
