use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use n0_error::{Result, StdResultExt, anyerr, ensure_any};

use super::{AuthSchemeKind, challenge::AuthChallenge};
use crate::credentials::SecurityContext;

#[derive(Debug, Clone, PartialEq, Eq)]
enum NegotiateState {
    Uninitiated,
    ChallengeReceived(Option<Vec<u8>>),
    TokenGenerated,
    Failed,
}

/// SPNEGO and Kerberos: opaque tokens exchanged with a [`SecurityContext`].
///
/// Unlike NTLM the number of legs is not fixed. The proxy continues the
/// handshake by sending a token with its 407 and ends it by accepting the
/// request; a bare re-challenge after our token means failure.
pub(crate) struct NegotiateScheme {
    kind: AuthSchemeKind,
    context: Box<dyn SecurityContext>,
    state: NegotiateState,
}

impl fmt::Debug for NegotiateScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiateScheme")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl NegotiateScheme {
    pub(crate) fn new(kind: AuthSchemeKind, context: Box<dyn SecurityContext>) -> Self {
        Self {
            kind,
            context,
            state: NegotiateState::Uninitiated,
        }
    }

    pub(crate) fn kind(&self) -> AuthSchemeKind {
        self.kind
    }

    pub(crate) fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<()> {
        let token = match &challenge.token68 {
            Some(token) => match STANDARD.decode(token) {
                Ok(token) => Some(token),
                Err(err) => {
                    self.state = NegotiateState::Failed;
                    return Err(err).std_context("invalid base64 in Negotiate challenge");
                }
            },
            None => None,
        };
        self.state = match (&self.state, token) {
            (NegotiateState::Uninitiated, token) => NegotiateState::ChallengeReceived(token),
            (NegotiateState::TokenGenerated, Some(token)) => {
                NegotiateState::ChallengeReceived(Some(token))
            }
            _ => NegotiateState::Failed,
        };
        Ok(())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == NegotiateState::Failed
    }

    pub(crate) fn authenticate(&mut self) -> Result<String> {
        let NegotiateState::ChallengeReceived(input) =
            std::mem::replace(&mut self.state, NegotiateState::Failed)
        else {
            return Err(anyerr!("{} token requested without a challenge", self.kind));
        };
        let output = self.context.step(input.as_deref())?;
        ensure_any!(!output.is_empty(), "security context produced an empty token");
        self.state = NegotiateState::TokenGenerated;
        Ok(format!(
            "{} {}",
            self.kind.header_prefix(),
            STANDARD.encode(output)
        ))
    }
}

#[cfg(test)]
mod tests {
    use n0_error::AnyError;

    use super::*;
    use crate::auth::challenge::parse_challenges;

    #[derive(Default)]
    struct Echo;

    impl SecurityContext for Echo {
        fn step(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, AnyError> {
            let mut out = b"out:".to_vec();
            out.extend_from_slice(input.unwrap_or(b"-"));
            Ok(out)
        }
    }

    #[test]
    fn continues_while_proxy_sends_tokens() {
        let mut scheme = NegotiateScheme::new(AuthSchemeKind::Spnego, Box::new(Echo));
        scheme.process_challenge(&parse_challenges("Negotiate")[0]).unwrap();
        assert_eq!(
            scheme.authenticate().unwrap(),
            format!("Negotiate {}", STANDARD.encode("out:-"))
        );

        let token = STANDARD.encode("server");
        scheme
            .process_challenge(&parse_challenges(&format!("Negotiate {token}"))[0])
            .unwrap();
        assert!(!scheme.is_complete());
        assert_eq!(
            scheme.authenticate().unwrap(),
            format!("Negotiate {}", STANDARD.encode("out:server"))
        );

        scheme.process_challenge(&parse_challenges("Negotiate")[0]).unwrap();
        assert!(scheme.is_complete());
        assert!(scheme.authenticate().is_err());
    }

    #[test]
    fn kerberos_sends_negotiate_prefix() {
        let mut scheme = NegotiateScheme::new(AuthSchemeKind::Kerberos, Box::new(Echo));
        scheme.process_challenge(&parse_challenges("Kerberos")[0]).unwrap();
        assert!(scheme.authenticate().unwrap().starts_with("Negotiate "));
    }

    #[test]
    fn invalid_token_fails() {
        let mut scheme = NegotiateScheme::new(AuthSchemeKind::Spnego, Box::new(Echo));
        assert!(scheme.process_challenge(&parse_challenges("Negotiate abc")[0]).is_err());
        assert!(scheme.is_complete());
    }
}
