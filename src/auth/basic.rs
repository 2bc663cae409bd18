use base64::{Engine, engine::general_purpose::STANDARD};

use super::challenge::AuthChallenge;
use crate::{config::HeaderCharset, credentials::Credentials};

/// Basic authentication (RFC 7617).
#[derive(Debug)]
pub(crate) struct BasicScheme {
    credentials: Credentials,
    charset: HeaderCharset,
    complete: bool,
}

impl BasicScheme {
    pub(crate) fn new(credentials: Credentials, charset: HeaderCharset) -> Self {
        Self {
            credentials,
            charset,
            complete: false,
        }
    }

    /// Basic has a single round: any challenge completes it.
    pub(crate) fn process_challenge(&mut self, challenge: &AuthChallenge) {
        if challenge
            .param("charset")
            .is_some_and(|charset| charset.eq_ignore_ascii_case("utf-8"))
        {
            self.charset = HeaderCharset::Utf8;
        }
        self.complete = true;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn authenticate(&self) -> String {
        let pair = format!(
            "{}:{}",
            self.credentials.username(),
            self.credentials.password()
        );
        format!("Basic {}", STANDARD.encode(self.charset.encode(&pair)))
    }
}
