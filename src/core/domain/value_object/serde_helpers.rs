//! Serde helpers for the loosely typed values the Proxmox API returns.

use serde::{Deserialize, Deserializer};

/// Proxmox reports flags as `0`/`1`, `true`/`false` or `"1"` depending on the endpoint.
pub mod proxmox_bool {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Flag::deserialize(deserializer)? {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
            Flag::Str(s) => matches!(s.as_str(), "1" | "true" | "yes" | "on"),
        })
    }
}

/// Numbers that some Proxmox versions send as strings (`"memory": "4096"`).
pub mod number_or_string {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Int(u64),
        Str(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Number>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Number::Int(i)) => Ok(Some(i)),
            Some(Number::Str(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("'{s}' is not a number"))),
        }
    }
}
