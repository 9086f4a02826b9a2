//! Identifier newtypes.
//!
//! The API is inconsistent about id encoding: the same user id arrives as a
//! number in `/organizations` and as a string in stream frames. Every id type
//! here accepts both on input.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                value.trim().parse().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match RawId::deserialize(deserializer)? {
                    RawId::Number(value) => Ok(Self(value)),
                    RawId::Text(text) => text.parse().map_err(de::Error::custom),
                }
            }
        }
    };
}

numeric_id!(
    /// Organization id.
    OrganizationId
);
numeric_id!(
    /// User id, also carried by the `flowdock-user` response header.
    UserId
);
numeric_id!(
    /// Message id within a flow.
    MessageId
);

/// Flow id. Opaque on the wire; numeric ids are kept in their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FlowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FlowId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for FlowId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FlowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawId::deserialize(deserializer)? {
            RawId::Number(value) => Ok(Self(value.to_string())),
            RawId::Text(text) => Ok(Self(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_accept_strings_and_numbers() {
        let from_number: UserId = serde_json::from_value(json!(42)).unwrap();
        let from_text: UserId = serde_json::from_value(json!("42")).unwrap();
        assert_eq!(from_number, from_text);
        assert_eq!(from_number.get(), 42);
    }

    #[test]
    fn numeric_ids_reject_garbage() {
        let result: Result<UserId, _> = serde_json::from_value(json!("not-a-number"));
        assert!(result.is_err());
    }

    #[test]
    fn flow_ids_normalise_numbers_to_text() {
        let flow: FlowId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(flow, FlowId::from("7"));
        assert_eq!(serde_json::to_value(&flow).unwrap(), json!("7"));
    }
}
