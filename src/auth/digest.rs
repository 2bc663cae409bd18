use md5::{Digest as _, Md5};
use n0_error::{Result, StackResultExt, anyerr};
use sha2::Sha256;

use super::challenge::AuthChallenge;
use crate::{config::HeaderCharset, credentials::Credentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(name: &str) -> Option<Self> {
        let algorithm = match name.to_ascii_uppercase().as_str() {
            "MD5" => Self::Md5,
            "MD5-SESS" => Self::Md5Sess,
            "SHA-256" => Self::Sha256,
            "SHA-256-SESS" => Self::Sha256Sess,
            _ => return None,
        };
        Some(algorithm)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }

    fn hash(self, data: &[u8]) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex::encode(Md5::digest(data)),
            Self::Sha256 | Self::Sha256Sess => hex::encode(Sha256::digest(data)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Inputs of a single digest computation (RFC 7616 §3.4.1).
#[derive(Debug)]
pub(crate) struct DigestInput<'a> {
    pub algorithm: DigestAlgorithm,
    pub username: &'a [u8],
    pub realm: &'a [u8],
    pub password: &'a [u8],
    pub nonce: &'a str,
    pub cnonce: &'a str,
    pub nonce_count: u32,
    pub qop: Option<Qop>,
    pub method: &'a str,
    pub uri: &'a str,
}

impl DigestInput<'_> {
    pub(crate) fn response(&self) -> String {
        let h = |parts: &[&[u8]]| self.algorithm.hash(&parts.join(&b':'));
        let mut ha1 = h(&[self.username, self.realm, self.password]);
        if self.algorithm.is_session() {
            ha1 = h(&[ha1.as_bytes(), self.nonce.as_bytes(), self.cnonce.as_bytes()]);
        }
        let ha2 = match self.qop {
            // CONNECT requests carry no entity body
            Some(Qop::AuthInt) => h(&[
                self.method.as_bytes(),
                self.uri.as_bytes(),
                self.algorithm.hash(b"").as_bytes(),
            ]),
            _ => h(&[self.method.as_bytes(), self.uri.as_bytes()]),
        };
        match self.qop {
            Some(qop) => h(&[
                ha1.as_bytes(),
                self.nonce.as_bytes(),
                format!("{:08x}", self.nonce_count).as_bytes(),
                self.cnonce.as_bytes(),
                qop.as_str().as_bytes(),
                ha2.as_bytes(),
            ]),
            None => h(&[ha1.as_bytes(), self.nonce.as_bytes(), ha2.as_bytes()]),
        }
    }
}

/// Digest access authentication (RFC 7616, RFC 2617).
#[derive(Debug)]
pub(crate) struct DigestScheme {
    credentials: Credentials,
    charset: HeaderCharset,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Option<DigestAlgorithm>,
    qop: Option<Qop>,
    stale: bool,
    challenged: bool,
    last_nonce: Option<String>,
    nonce_count: u32,
}

impl DigestScheme {
    pub(crate) fn new(credentials: Credentials, charset: HeaderCharset) -> Self {
        Self {
            credentials,
            charset,
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            algorithm: None,
            qop: None,
            stale: false,
            challenged: false,
            last_nonce: None,
            nonce_count: 0,
        }
    }

    pub(crate) fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<()> {
        let realm = challenge.param("realm").context("missing realm")?;
        let nonce = challenge.param("nonce").context("missing nonce")?;
        let algorithm = match challenge.param("algorithm") {
            None => None,
            Some(name) => Some(
                DigestAlgorithm::parse(name)
                    .ok_or_else(|| anyerr!("unsupported digest algorithm {name:?}"))?,
            ),
        };
        let qop = match challenge.param("qop") {
            None => None,
            Some(list) => {
                let offered: Vec<String> = list
                    .split(',')
                    .map(|qop| qop.trim().to_ascii_lowercase())
                    .collect();
                if offered.iter().any(|qop| qop == "auth") {
                    Some(Qop::Auth)
                } else if offered.iter().any(|qop| qop == "auth-int") {
                    Some(Qop::AuthInt)
                } else {
                    return Err(anyerr!("none of the offered qop values is supported: {list:?}"));
                }
            }
        };
        self.realm = realm.to_owned();
        self.nonce = nonce.to_owned();
        self.opaque = challenge.param("opaque").map(ToOwned::to_owned);
        self.algorithm = algorithm;
        self.qop = qop;
        self.stale = challenge
            .param("stale")
            .is_some_and(|stale| stale.eq_ignore_ascii_case("true"));
        self.challenged = true;
        Ok(())
    }

    /// A re-challenge means the credentials were rejected, unless the nonce
    /// was merely stale.
    pub(crate) fn is_complete(&self) -> bool {
        self.challenged && !self.stale
    }

    pub(crate) fn authenticate(&mut self, method: &str, uri: &str) -> Result<String> {
        if !self.challenged {
            return Err(anyerr!("digest response requested before any challenge"));
        }
        if self.last_nonce.as_deref() == Some(self.nonce.as_str()) {
            self.nonce_count += 1;
        } else {
            self.last_nonce = Some(self.nonce.clone());
            self.nonce_count = 1;
        }
        let cnonce = hex::encode(rand::random::<[u8; 8]>());
        let username = self.charset.encode(self.credentials.username());
        let realm = self.charset.encode(&self.realm);
        let password = self.charset.encode(self.credentials.password());
        let input = DigestInput {
            algorithm: self.algorithm.unwrap_or(DigestAlgorithm::Md5),
            username: &username,
            realm: &realm,
            password: &password,
            nonce: &self.nonce,
            cnonce: &cnonce,
            nonce_count: self.nonce_count,
            qop: self.qop,
            method,
            uri,
        };
        let response = input.response();

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            quote(self.credentials.username()),
            quote(&self.realm),
            quote(&self.nonce),
            quote(uri),
            response,
        );
        if let Some(qop) = self.qop {
            header.push_str(&format!(
                ", qop={}, nc={:08x}, cnonce=\"{}\"",
                qop.as_str(),
                self.nonce_count,
                cnonce
            ));
        }
        if let Some(algorithm) = self.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm.name()));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", quote(opaque)));
        }
        Ok(header)
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
