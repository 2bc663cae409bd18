use std::collections::VecDeque;

use http::StatusCode;
use tracing::{debug, warn};

use super::{AuthChallenge, AuthScheme, AuthSchemeKind, AuthSchemeRegistry};
use crate::{
    config::HeaderCharset,
    credentials::CredentialsProvider,
    parse::{Authority, ConnectRequest, HttpResponse},
};

/// Progress of the proxy authentication within one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No challenge seen yet.
    Unchallenged,
    /// Candidate schemes selected; the first response is being tried.
    Challenged,
    /// A multi-leg scheme is in the middle of its handshake.
    Handshake,
    /// The proxy accepted our credentials.
    Resolved,
    /// No further answer can be produced. Terminal.
    Exhausted,
}

/// Authentication state owned by a single negotiation.
#[derive(Debug)]
pub struct AuthExchange {
    state: AuthState,
    scheme: Option<AuthScheme>,
    queued: VecDeque<AuthScheme>,
    rounds: u32,
    max_rounds: u32,
}

impl AuthExchange {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            state: AuthState::Unchallenged,
            scheme: None,
            queued: VecDeque::new(),
            rounds: 0,
            max_rounds,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Number of challenges answered so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// The scheme currently answering challenges.
    pub fn scheme(&self) -> Option<AuthSchemeKind> {
        self.scheme.as_ref().map(AuthScheme::kind)
    }

    /// Forgets the selected scheme. The round counter keeps running.
    fn reset(&mut self) {
        self.state = AuthState::Unchallenged;
        self.scheme = None;
        self.queued.clear();
    }

    fn exhaust(&mut self) -> bool {
        self.state = AuthState::Exhausted;
        self.queued.clear();
        false
    }

    fn next_round(&mut self) -> bool {
        if self.rounds >= self.max_rounds {
            debug!(rounds = self.rounds, "authentication round limit reached");
            return self.exhaust();
        }
        self.rounds += 1;
        true
    }
}

fn find(challenges: &[AuthChallenge], kind: AuthSchemeKind) -> Option<&AuthChallenge> {
    challenges
        .iter()
        .find(|challenge| challenge.is_scheme(kind.challenge_name()))
}

/// Interprets proxy challenges on behalf of one negotiation.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeHandler<'a> {
    registry: &'a AuthSchemeRegistry,
    credentials: &'a dyn CredentialsProvider,
    proxy: &'a Authority,
    charset: HeaderCharset,
}

impl<'a> ChallengeHandler<'a> {
    pub fn new(
        registry: &'a AuthSchemeRegistry,
        credentials: &'a dyn CredentialsProvider,
        proxy: &'a Authority,
        charset: HeaderCharset,
    ) -> Self {
        Self {
            registry,
            credentials,
            proxy,
            charset,
        }
    }

    pub fn challenges(&self, response: &HttpResponse) -> Vec<AuthChallenge> {
        AuthChallenge::from_response(response, self.charset)
    }

    /// A 407 naming at least one enabled scheme.
    pub fn is_challenge(&self, response: &HttpResponse) -> bool {
        response.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
            && self
                .challenges(response)
                .iter()
                .any(|challenge| self.registry.lookup(&challenge.scheme).is_some())
    }

    /// Offered and enabled schemes, most preferred first.
    pub fn select_scheme(&self, challenges: &[AuthChallenge]) -> Vec<AuthSchemeKind> {
        AuthSchemeKind::PREFERENCE
            .into_iter()
            .filter(|kind| self.registry.supports(*kind) && find(challenges, *kind).is_some())
            .collect()
    }

    /// Advances `exchange` with a challenge response.
    ///
    /// Returns whether the request should be retried with (new) credentials.
    pub fn update_state(&self, exchange: &mut AuthExchange, response: &HttpResponse) -> bool {
        let challenges = self.challenges(response);
        match exchange.state {
            AuthState::Exhausted => return false,
            AuthState::Resolved => exchange.reset(),
            AuthState::Unchallenged => {}
            AuthState::Challenged | AuthState::Handshake => {
                let Some(scheme) = exchange.scheme.as_mut() else {
                    debug!("challenged again before any scheme answered");
                    return exchange.exhaust();
                };
                let kind = scheme.kind();
                match find(&challenges, kind) {
                    Some(challenge) => {
                        if let Err(err) = scheme.process_challenge(challenge) {
                            warn!("{err:#}");
                            return exchange.exhaust();
                        }
                        if scheme.is_complete() {
                            debug!(%kind, "proxy rejected our credentials");
                            return exchange.exhaust();
                        }
                        exchange.state = AuthState::Handshake;
                        return exchange.next_round();
                    }
                    None => {
                        debug!(%kind, "scheme no longer offered, selecting again");
                        exchange.reset();
                    }
                }
            }
        }

        let candidates = self.select_scheme(&challenges);
        if candidates.is_empty() {
            debug!("no supported authentication scheme offered");
            return exchange.exhaust();
        }
        let mut options = VecDeque::new();
        for kind in candidates {
            let Some(challenge) = find(&challenges, kind) else {
                continue;
            };
            match self.registry.create(
                kind,
                challenge,
                self.credentials,
                self.proxy,
                self.charset,
            ) {
                Ok(Some(scheme)) => options.push_back(scheme),
                Ok(None) => debug!(%kind, "no credentials available"),
                Err(err) => warn!("{err:#}"),
            }
        }
        if options.is_empty() {
            return exchange.exhaust();
        }
        debug!(
            schemes = ?options.iter().map(AuthScheme::kind).collect::<Vec<_>>(),
            "proxy authentication required"
        );
        exchange.queued = options;
        exchange.state = AuthState::Challenged;
        exchange.next_round()
    }

    /// Sets `Proxy-Authorization` on `request` for the current scheme.
    pub fn attach_header(&self, request: &mut ConnectRequest, exchange: &mut AuthExchange) {
        match exchange.state {
            AuthState::Challenged => {
                while let Some(mut scheme) = exchange.queued.pop_front() {
                    match scheme.authenticate(request, self.charset) {
                        Ok(value) => {
                            debug!(scheme = %scheme.kind(), "answering proxy challenge");
                            request.set_auth_header(value);
                            exchange.scheme = Some(scheme);
                            return;
                        }
                        Err(err) => warn!("{err:#}"),
                    }
                }
                if exchange.scheme.is_none() {
                    exchange.exhaust();
                    request.remove_auth_header();
                }
            }
            AuthState::Handshake => {
                let Some(scheme) = exchange.scheme.as_mut() else {
                    return;
                };
                match scheme.authenticate(request, self.charset) {
                    Ok(value) => request.set_auth_header(value),
                    Err(err) => {
                        warn!("{err:#}");
                        exchange.exhaust();
                        request.remove_auth_header();
                    }
                }
            }
            AuthState::Unchallenged | AuthState::Resolved | AuthState::Exhausted => {}
        }
    }

    /// Single entry point for every response of the negotiation.
    ///
    /// Returns whether the request should be sent again.
    pub fn on_response(&self, exchange: &mut AuthExchange, response: &HttpResponse) -> bool {
        if self.is_challenge(response) {
            return self.update_state(exchange, response);
        }
        if !matches!(exchange.state, AuthState::Challenged | AuthState::Handshake) {
            return false;
        }
        if response.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            debug!(scheme = ?exchange.scheme(), "proxy dropped its challenge after a response");
            return exchange.exhaust();
        }
        debug!(scheme = ?exchange.scheme(), "proxy authentication succeeded");
        exchange.state = AuthState::Resolved;
        false
    }
}
