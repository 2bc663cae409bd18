//! Proxy authentication.
//!
//! A [`ChallengeHandler`] inspects every proxy response of a negotiation and
//! drives an [`AuthExchange`]: it picks a scheme from the `Proxy-Authenticate`
//! challenges, feeds follow-up challenges to it and produces the
//! `Proxy-Authorization` header for the next attempt.

use http::HeaderValue;
use n0_error::{AnyError, e, stack_error};

pub use self::{
    challenge::{AuthChallenge, parse_challenges},
    exchange::{AuthExchange, AuthState, ChallengeHandler},
    registry::{AuthSchemeKind, AuthSchemeRegistry},
};
#[cfg(windows)]
pub use self::sspi::SspiCredentialsProvider;
use self::{basic::BasicScheme, digest::DigestScheme, negotiate::NegotiateScheme, ntlm::NtlmScheme};
use crate::{config::HeaderCharset, parse::ConnectRequest};

mod basic;
mod challenge;
mod digest;
mod exchange;
mod negotiate;
mod ntlm;
mod registry;
#[cfg(windows)]
mod sspi;

/// Failure of a single scheme. Logged and treated as "cannot answer".
#[stack_error(derive, add_meta)]
pub(crate) enum AuthError {
    #[error("malformed {scheme} challenge")]
    MalformedChallenge {
        scheme: AuthSchemeKind,
        #[error(source)]
        source: AnyError,
    },
    #[error("{scheme} failed to produce a response")]
    Response {
        scheme: AuthSchemeKind,
        #[error(source)]
        source: AnyError,
    },
    #[error("{scheme} response is not a valid header value")]
    InvalidHeader { scheme: AuthSchemeKind },
}

/// A scheme handler bound to the credentials it answers with.
#[derive(Debug)]
pub(crate) enum AuthScheme {
    Basic(BasicScheme),
    Digest(DigestScheme),
    Ntlm(NtlmScheme),
    Negotiate(NegotiateScheme),
}

impl AuthScheme {
    pub(crate) fn kind(&self) -> AuthSchemeKind {
        match self {
            AuthScheme::Basic(_) => AuthSchemeKind::Basic,
            AuthScheme::Digest(_) => AuthSchemeKind::Digest,
            AuthScheme::Ntlm(_) => AuthSchemeKind::Ntlm,
            AuthScheme::Negotiate(scheme) => scheme.kind(),
        }
    }

    pub(crate) fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<(), AuthError> {
        let scheme = self.kind();
        let res = match self {
            AuthScheme::Basic(basic) => {
                basic.process_challenge(challenge);
                Ok(())
            }
            AuthScheme::Digest(digest) => digest.process_challenge(challenge),
            AuthScheme::Ntlm(ntlm) => ntlm.process_challenge(challenge),
            AuthScheme::Negotiate(negotiate) => negotiate.process_challenge(challenge),
        };
        res.map_err(|source| e!(AuthError::MalformedChallenge { scheme, source }))
    }

    /// Whether a further challenge for this scheme means the exchange failed.
    pub(crate) fn is_complete(&self) -> bool {
        match self {
            AuthScheme::Basic(basic) => basic.is_complete(),
            AuthScheme::Digest(digest) => digest.is_complete(),
            AuthScheme::Ntlm(ntlm) => ntlm.is_complete(),
            AuthScheme::Negotiate(negotiate) => negotiate.is_complete(),
        }
    }

    /// Produces the `Proxy-Authorization` value for `request`.
    pub(crate) fn authenticate(
        &mut self,
        request: &ConnectRequest,
        charset: HeaderCharset,
    ) -> Result<HeaderValue, AuthError> {
        let scheme = self.kind();
        let value = match self {
            AuthScheme::Basic(basic) => Ok(basic.authenticate()),
            AuthScheme::Digest(digest) => {
                digest.authenticate(request.method().as_str(), &request.request_target())
            }
            AuthScheme::Ntlm(ntlm) => ntlm.authenticate(),
            AuthScheme::Negotiate(negotiate) => negotiate.authenticate(),
        }
        .map_err(|source| e!(AuthError::Response { scheme, source }))?;
        HeaderValue::from_bytes(&charset.encode(&value))
            .map_err(|_| e!(AuthError::InvalidHeader { scheme }))
    }
}
