//! Wallet identity used to scope position fetches

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FetchError;

/// Base58 alphabet (no `0`, `O`, `I`, `l`)
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Shortest and longest base58 encoding of a 32-byte public key
const MIN_ADDRESS_LEN: usize = 32;
const MAX_ADDRESS_LEN: usize = 44;

/// The connected wallet, as handed over by the wallet adapter
///
/// Construction does not validate: the address is checked right before an
/// identity-scoped fetch so a bad address surfaces as a fetch error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the address looks like a base58 public key
    pub fn validate(&self) -> Result<(), FetchError> {
        let len = self.0.len();
        if !(MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&len) {
            return Err(FetchError::IdentityInvalid(format!(
                "'{}' has length {}, expected {}-{}",
                self.0, len, MIN_ADDRESS_LEN, MAX_ADDRESS_LEN
            )));
        }
        if let Some(c) = self.0.chars().find(|c| !BASE58_ALPHABET.contains(*c)) {
            return Err(FetchError::IdentityInvalid(format!(
                "'{}' contains non-base58 character '{}'",
                self.0, c
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_address_passes() {
        let identity = Identity::new("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin");
        assert!(identity.validate().is_ok());
    }

    #[test]
    fn test_short_address_is_rejected() {
        let identity = Identity::new("abc");
        assert!(matches!(
            identity.validate(),
            Err(FetchError::IdentityInvalid(_))
        ));
    }

    #[test]
    fn test_non_base58_character_is_rejected() {
        // '0' is not part of the base58 alphabet
        let identity = Identity::new("0xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin");
        let err = identity.validate().unwrap_err();
        assert!(err.to_string().contains("'0'"));
    }

    #[test]
    fn test_display_is_raw_address() {
        let identity = Identity::new("wallet");
        assert_eq!(identity.to_string(), "wallet");
    }
}
