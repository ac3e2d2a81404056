//! Out-of-band pairing material and its exchange-line codec.
//!
//! Secrets travel over a line-oriented side channel as exactly four
//! whitespace-separated tokens:
//!
//! ```text
//! C0:11:22:33:44:5A (random) 9d3b...32 hex chars...c1 04fe...32 hex chars...77
//! ```
//!
//! The address is uppercase, the kind token is parenthesized the way the
//! controller prints it, and the 16-byte random/confirm values are lowercase
//! hex. Parsing also tolerates the bare kind form (`random`).

use std::str::FromStr;

use crate::addr::{AddrKind, AddrParseError, PeerAddr};

/// Byte length of the LE Secure Connections random and confirm values.
pub const OOB_KEY_LEN: usize = 16;

/// One peer's out-of-band pairing material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OobSecret {
    /// Address the secret was generated for.
    pub addr: PeerAddr,
    /// LE address kind.
    pub kind: AddrKind,
    /// Secure Connections random value.
    pub random: [u8; OOB_KEY_LEN],
    /// Secure Connections confirm value.
    pub confirm: [u8; OOB_KEY_LEN],
}

impl OobSecret {
    /// Parse one exchange line.
    ///
    /// # Errors
    ///
    /// Returns an [`OobParseError`] when the token count, address, kind, or
    /// either key is malformed. Callers on the exchange path drop such lines
    /// without replying.
    pub fn parse_line(line: &str) -> Result<Self, OobParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [addr, kind, random, confirm] = tokens[..] else {
            return Err(OobParseError::TokenCount(tokens.len()));
        };
        Ok(Self {
            addr: addr.parse()?,
            kind: kind.parse()?,
            random: decode_key(random)?,
            confirm: decode_key(confirm)?,
        })
    }

    /// Format as one exchange line, without a trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{} ({}) {} {}",
            self.addr,
            self.kind,
            encode_key(&self.random),
            encode_key(&self.confirm)
        )
    }
}

fn decode_key(token: &str) -> Result<[u8; OOB_KEY_LEN], OobParseError> {
    if token.len() != OOB_KEY_LEN * 2 {
        return Err(OobParseError::KeyLength(token.len()));
    }
    let mut key = [0u8; OOB_KEY_LEN];
    for (byte, pair) in key.iter_mut().zip(token.as_bytes().chunks_exact(2)) {
        let pair = std::str::from_utf8(pair).map_err(|_| OobParseError::KeyDigit)?;
        *byte = u8::from_str_radix(pair, 16).map_err(|_| OobParseError::KeyDigit)?;
    }
    Ok(key)
}

fn encode_key(key: &[u8; OOB_KEY_LEN]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

/// Why an exchange line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OobParseError {
    /// A line must carry exactly four tokens.
    #[error("expected 4 tokens, got {0}")]
    TokenCount(usize),
    /// Bad address or kind token.
    #[error(transparent)]
    Addr(#[from] AddrParseError),
    /// A key token was not 32 characters.
    #[error("expected {n} hex chars per key, got {0}", n = OOB_KEY_LEN * 2)]
    KeyLength(usize),
    /// A key token contained a non-hex digit.
    #[error("key token contains a non-hex digit")]
    KeyDigit,
}

impl FromStr for OobSecret {
    type Err = OobParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_line(s)
    }
}
