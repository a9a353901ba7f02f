//! Challenge codes: 8 uppercase alphanumeric characters.

use rand::Rng;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

pub const CODE_LENGTH: usize = 8;
pub const CODE_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Code(String);

impl Code {
    /// Sample a code uniformly from the alphabet. Uniqueness among live codes
    /// is the store's concern, not the generator's.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..CODE_LENGTH)
            .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
            .collect();
        Self(code)
    }

    /// Accept only strings that look exactly like a code.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if valid_code(value) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Code {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn code_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9A-Z]{8}$").ok())
        .as_ref()
}

/// Whether `value` has the shape of a code. Chat text that fails this never
/// reaches the store.
#[must_use]
pub fn valid_code(value: &str) -> bool {
    code_pattern().is_some_and(|re| re.is_match(value))
}
