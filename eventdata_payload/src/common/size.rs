//! Human readable byte sizes, as used for daily logging volumes.
//!
//! Units are binary: `kB` is 1024 bytes, `MB` 1024 kB and `GB` 1024 MB. At
//! most one space may separate the value from the unit.

use byte_unit::Byte;
use once_cell::sync::Lazy;
use regex::Regex;

static SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s?(kB|MB|GB)?$").expect("Invalid regex pattern provided"));

/// Errors produced by [`parse`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input does not match `<int>[ ][kB|MB|GB]`
    #[error("Invalid byte size value [{0}]")]
    Invalid(String),
}

/// Convert a size string like `8kB` or `100 MB` to bytes.
///
/// # Errors
///
/// Returns an error if `size` is not a plain non-negative integer with an
/// optional `kB`, `MB` or `GB` suffix, or if the result does not fit in a
/// u64.
pub fn parse(size: &str) -> Result<Byte, Error> {
    let invalid = || Error::Invalid(size.to_string());
    let caps = SIZE.captures(size).ok_or_else(invalid)?;
    let value: u64 = caps[1].parse().map_err(|_| invalid())?;
    let shift = match caps.get(2).map(|m| m.as_str()) {
        None => 0,
        Some("kB") => 10,
        Some("MB") => 20,
        Some("GB") => 30,
        Some(_) => unreachable!("regex admits only kB, MB and GB"),
    };
    let bytes = value
        .checked_mul(1_u64 << shift)
        .ok_or_else(invalid)?;
    Ok(Byte::from_u64(bytes))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::{Error, parse};

    fn bytes(s: &str) -> u64 {
        parse(s).expect("valid size").as_u64()
    }

    #[test]
    fn plain_bytes() {
        assert_eq!(bytes("3"), 3);
        assert_eq!(bytes("3786234876"), 3_786_234_876);
    }

    #[test]
    fn binary_units() {
        assert_eq!(bytes("3 kB"), 3 * 1024);
        assert_eq!(bytes("3972 kB"), 3972 * 1024);
        assert_eq!(bytes("100 MB"), 100 * 1024 * 1024);
        assert_eq!(bytes("10MB"), 10 * 1024 * 1024);
        assert_eq!(bytes("3 GB"), 3 * 1024 * 1024 * 1024);
    }

    #[test]
    fn invalid_sizes() {
        for input in ["3.4", "3gb", "kB", "3  kB", "-3", "3 TB", ""] {
            assert_eq!(
                parse(input),
                Err(Error::Invalid(input.to_string())),
                "{input}"
            );
        }
        assert_eq!(
            parse("3.4").unwrap_err().to_string(),
            "Invalid byte size value [3.4]"
        );
    }

    proptest! {
        #[test]
        fn kilobytes_are_binary(value in 0_u64..1_000_000) {
            prop_assert_eq!(bytes(&format!("{value}kB")), value << 10);
            prop_assert_eq!(bytes(&format!("{value} kB")), value << 10);
        }
    }
}
