//! Random identity tokens.
//!
//! Every client gets a token when it is created and keeps it across
//! reconnects; the token doubles as the name of the client's dedicated
//! channel. Every outgoing call gets a fresh token as its packet id.
//!
//! Tokens are version-4 UUIDs (122 random bits) and travel on the wire in
//! their hyphenated string form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A collision-resistant random token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(Uuid);

impl Token {
    /// Generate a fresh random token.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Token {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TokenParseError::Empty);
        }

        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TokenParseError::Malformed(s.to_string()))
    }
}

impl TryFrom<String> for Token {
    type Error = TokenParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.to_string()
    }
}

/// Error parsing a token string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenParseError {
    #[error("token cannot be empty")]
    Empty,
    #[error("token must be a hyphenated uuid, got: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_differ() {
        let a = Token::random();
        let b = Token::random();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn parse_display_form() {
        let token = Token::random();
        let parsed: Token = token.to_string().parse().unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn reject_garbage() {
        assert!(matches!("".parse::<Token>(), Err(TokenParseError::Empty)));
        assert!(matches!(
            "local:alice".parse::<Token>(),
            Err(TokenParseError::Malformed(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let token = Token::random();
        let json = serde_json::to_value(token).unwrap();
        assert_eq!(json, serde_json::Value::String(token.to_string()));
    }
}
