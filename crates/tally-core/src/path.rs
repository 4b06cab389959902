//! File path grammar.
//!
//! Every file path written by the storage hub is owned by an address:
//!
//! ```text
//! path    = address "/" remainder
//! address = 1*( any char except "/" )
//! ```
//!
//! The remainder is opaque and may contain further `/` separators.
//!
//! # Example
//!
//! ```rust
//! use tally_core::path::extract_address;
//!
//! let address = extract_address("1BoatSLRHtKNngkdXEeobR76b53LETtpyT/photos/a.jpg").unwrap();
//! assert_eq!(address.as_str(), "1BoatSLRHtKNngkdXEeobR76b53LETtpyT");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// The namespace owning a set of file paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Creates an address after checking it is a single non-empty segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is empty or contains `/`.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        if address.is_empty() {
            return Err(Error::InvalidInput("address cannot be empty".to_string()));
        }
        if address.contains('/') {
            return Err(Error::InvalidInput(format!(
                "address '{address}' cannot contain '/'"
            )));
        }
        Ok(Self(address))
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the listing prefix covering every path owned by this address.
    #[must_use]
    pub fn path_prefix(&self) -> String {
        format!("{}/", self.0)
    }

    /// Returns the exclusive upper bound for a key-range scan over [`Self::path_prefix`].
    ///
    /// `'0'` is the byte right after `'/'`, so `[prefix, upper)` covers exactly the
    /// paths under this address.
    #[must_use]
    pub fn path_upper_bound(&self) -> String {
        format!("{}0", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Extracts the owning address from a file path.
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] if the path is empty, starts with `/`, or has
/// no non-empty remainder after the address segment.
pub fn extract_address(path: &str) -> Result<Address> {
    if path.is_empty() {
        return Err(Error::invalid_path(path, "path is empty"));
    }

    let Some((address, remainder)) = path.split_once('/') else {
        return Err(Error::invalid_path(path, "missing '/' after address"));
    };

    if address.is_empty() {
        return Err(Error::invalid_path(path, "address segment is empty"));
    }
    if remainder.is_empty() {
        return Err(Error::invalid_path(path, "nothing after address"));
    }

    Ok(Address(address.to_string()))
}
