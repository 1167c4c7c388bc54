use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;

fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '.')
}

macro_rules! define_name_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind).map(Self)
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_name_type!(
    /// Plaintext identifier printed on or encoded in an RFID card.
    ///
    /// Lookups on the access-check path use the value as presented by the
    /// reader; validation only applies when a card is registered.
    CardIdentifier,
    "card identifier"
);
define_name_type!(
    /// Identifier of the reader device or tool that originated a check.
    DeviceId,
    "device id"
);

macro_rules! define_numeric_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw row id.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw row id.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

define_numeric_id!(
    /// Card row identifier.
    CardId
);
define_numeric_id!(
    /// Room row identifier.
    RoomId
);
define_numeric_id!(
    /// User row identifier.
    UserId
);
define_numeric_id!(
    /// Group row identifier.
    GroupId
);
define_numeric_id!(
    /// Permission row identifier.
    PermissionId
);
define_numeric_id!(
    /// Access log row identifier.
    LogId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_identifier_should_trim_input() {
        let id = CardIdentifier::new("  04A2-3B9F  ").expect("card identifier");
        assert_eq!(id.as_str(), "04A2-3B9F");
    }

    #[test]
    fn card_identifier_rejects_empty_value() {
        let err = CardIdentifier::new("   ").expect_err("must reject");
        assert!(err.to_string().contains("card identifier"));
    }

    #[test]
    fn card_identifier_rejects_invalid_chars() {
        let err = CardIdentifier::try_from("04 A2").expect_err("must reject");
        assert!(matches!(err, Error::InvalidId(_)));
    }

    #[test]
    fn numeric_ids_serialize_transparently() {
        let json = serde_json::to_string(&RoomId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
