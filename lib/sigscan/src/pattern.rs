//!
//! @file pattern.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Compiles textual byte signatures into a byte sequence and mask.
//! @bug No known bugs.
//!

use std::str::FromStr;

/// Describes the ways a signature string can fail to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("signature contains no tokens")]
    Empty,

    #[error("malformed signature token `{0}'")]
    BadToken(String)
}

///
/// A compiled byte signature.
///
/// Each position holds an expected byte and a flag marking whether that byte
/// actually participates in comparisons. Wildcard positions store zero and
/// are excluded from the mask. The two sequences are always the same,
/// non-zero, length, and a compiled pattern is never modified.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    bytes: Box<[u8]>,
    mask: Box<[bool]>
}

impl Pattern {
    /// Gets the length of the pattern, in bytes.
    pub fn len(
        &self
    ) -> usize {
        self.bytes.len()
    }

    /// Gets the expected byte sequence (zero at wildcard positions).
    pub (in crate) fn bytes(
        &self
    ) -> &[u8] {
        &self.bytes
    }

    /// Gets the inclusion mask. False positions match any byte.
    pub (in crate) fn mask(
        &self
    ) -> &[bool] {
        &self.mask
    }

    /// Checks if the pattern matches the data at the given offset in full.
    pub (in crate) fn matches_at(
        &self,
        data: &[u8],
        offset: usize
    ) -> bool {
        assert!(offset + self.len() <= data.len());

        for (c, b) in self.bytes.iter().enumerate() {
            if self.mask[c] && data[offset + c] != *b {
                return false;
            }
        }

        return true;
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    ///
    /// Compiles a signature string.
    ///
    /// Tokens are processed left to right. A lone "?" or "??" contributes one
    /// wildcard byte; a two digit hex token contributes one exact byte. Any
    /// other token, including a trailing single hex digit, is rejected rather
    /// than silently dropped.
    ///
    fn from_str(
        s: &str
    ) -> Result<Self, Self::Err> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for tok in s.split_ascii_whitespace() {
            match tok {
                "?" | "??" => {
                    bytes.push(0);
                    mask.push(false);
                },
                _ => {
                    if tok.len() != 2 || !tok.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return Err(PatternError::BadToken(tok.to_string()));
                    }

                    // Cannot fail; both digits were just checked.
                    bytes.push(u8::from_str_radix(tok, 16).unwrap());
                    mask.push(true);
                }
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self {
            bytes: bytes.into_boxed_slice(),
            mask: mask.into_boxed_slice()
        })
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{{ ")?;
        for (c, b) in self.bytes.iter().enumerate() {
            if self.mask[c] {
                write!(f, "{:02x} ", b)?;
            } else {
                write!(f, "?? ")?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_exact_bytes() {
        let p = Pattern::from_str("48 8b 05 E9").unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(p.bytes(), &[0x48, 0x8b, 0x05, 0xe9]);
        assert!(p.mask().iter().all(|m| *m));
    }

    #[test]
    fn single_and_double_question_marks_are_one_wildcard() {
        let single = Pattern::from_str("E9 ? ? ? ?").unwrap();
        let double = Pattern::from_str("E9 ?? ?? ?? ??").unwrap();
        assert_eq!(single, double);
        assert_eq!(single.len(), 5);
        assert_eq!(single.mask(), &[true, false, false, false, false]);
    }

    #[test]
    fn rejects_trailing_incomplete_token() {
        assert_eq!(
            Pattern::from_str("48 8b 0"),
            Err(PatternError::BadToken("0".to_string()))
        );
    }

    #[test]
    fn rejects_non_hex_and_overlong_tokens() {
        assert!(matches!(Pattern::from_str("4G"), Err(PatternError::BadToken(_))));
        assert!(matches!(Pattern::from_str("488b"), Err(PatternError::BadToken(_))));
        assert!(matches!(Pattern::from_str("???"), Err(PatternError::BadToken(_))));
    }

    #[test]
    fn rejects_empty_signatures() {
        assert_eq!(Pattern::from_str(""), Err(PatternError::Empty));
        assert_eq!(Pattern::from_str("   "), Err(PatternError::Empty));
    }

    #[test]
    fn displays_in_signature_notation() {
        let p = Pattern::from_str("e9 ?? 03").unwrap();
        assert_eq!(format!("{}", p), "{ e9 ?? 03 }");
    }
}
