//! `Proxy-Authenticate` challenge parsing (RFC 7235 §2.1, §4.3).

use http::header::PROXY_AUTHENTICATE;

use crate::{config::HeaderCharset, parse::HttpResponse};

/// A single authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Scheme name as sent by the proxy.
    pub scheme: String,
    pub token68: Option<String>,
    /// Parameters in order of appearance; names are lower-cased.
    pub params: Vec<(String, String)>,
}

impl AuthChallenge {
    fn new(scheme: String) -> Self {
        Self {
            scheme,
            token68: None,
            params: Vec::new(),
        }
    }

    /// Returns the value of the first parameter called `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_scheme(&self, name: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(name)
    }

    /// Parses every `Proxy-Authenticate` header of `response`.
    pub fn from_response(response: &HttpResponse, charset: HeaderCharset) -> Vec<AuthChallenge> {
        response
            .headers
            .get_all(PROXY_AUTHENTICATE)
            .iter()
            .flat_map(|value| parse_challenges(&charset.decode(value.as_bytes())))
            .collect()
    }
}

/// Parses a header value that may carry several comma-separated challenges.
///
/// Malformed input is skipped rather than rejected.
pub fn parse_challenges(input: &str) -> Vec<AuthChallenge> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let mut challenges = Vec::new();
    loop {
        parser.skip_list_separators();
        if parser.at_end() {
            break;
        }
        let scheme = parser.token();
        if scheme.is_empty() {
            // not a token start; skip the offending character
            parser.pos += 1;
            continue;
        }
        let mut challenge = AuthChallenge::new(scheme);
        parser.skip_ws();
        if let Some(token68) = parser.token68() {
            challenge.token68 = Some(token68);
        } else {
            parser.params(&mut challenge.params);
        }
        challenges.push(challenge);
    }
    challenges
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn is_token68_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~+/".contains(c)
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.pos += 1;
        }
    }

    fn skip_list_separators(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | ',')) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn token(&mut self) -> String {
        self.take_while(is_tchar)
    }

    /// Consumes a token68 if one stands alone before the end of the challenge.
    fn token68(&mut self) -> Option<String> {
        let start = self.pos;
        let mut value = self.take_while(is_token68_char);
        if !value.is_empty() {
            value.push_str(&self.take_while(|c| c == '='));
            self.skip_ws();
            if matches!(self.peek(), None | Some(',')) {
                return Some(value);
            }
        }
        self.pos = start;
        None
    }

    fn quoted_string(&mut self) -> String {
        // opening quote
        self.pos += 1;
        let mut value = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '"' => break,
                '\\' => {
                    if let Some(escaped) = self.peek() {
                        value.push(escaped);
                        self.pos += 1;
                    }
                }
                c => value.push(c),
            }
        }
        value
    }

    /// Whether the text after the current list separator is another
    /// `name=value` pair rather than the next challenge.
    fn param_follows(&mut self) -> bool {
        let start = self.pos;
        self.skip_list_separators();
        let name = self.token();
        self.skip_ws();
        let follows = !name.is_empty() && self.peek() == Some('=');
        self.pos = start;
        follows
    }

    fn params(&mut self, params: &mut Vec<(String, String)>) {
        loop {
            self.skip_ws();
            let start = self.pos;
            let name = self.token();
            self.skip_ws();
            if name.is_empty() || self.peek() != Some('=') {
                self.pos = start;
                return;
            }
            self.pos += 1;
            self.skip_ws();
            let value = if self.peek() == Some('"') {
                self.quoted_string()
            } else {
                self.token()
            };
            params.push((name.to_ascii_lowercase(), value));
            self.skip_ws();
            if self.peek() != Some(',') || !self.param_follows() {
                return;
            }
            self.skip_list_separators();
        }
    }
}
