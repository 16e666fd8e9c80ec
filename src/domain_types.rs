//! Strongly-typed domain values shared by the hub and the agent
//!
//! These newtypes prevent primitive obsession at the protocol and storage
//! boundaries: identifiers, auth tokens, and config epochs all validate on
//! construction.

use nutype::nutype;
use rand::Rng;

/// Length of every system identifier.
pub const SYSTEM_ID_LEN: usize = 15;

/// Maximum accepted length of an agent auth token.
pub const TOKEN_MAX_LEN: usize = 64;

/// Opaque identifier of a monitored system (15 characters)
#[nutype(
    validate(len_char_min = 15, len_char_max = 15),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct SystemId(String);

impl SystemId {
    /// Creates a new random system ID
    pub fn generate() -> Self {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let id: String = (0..SYSTEM_ID_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self::try_new(id).expect("generated id has fixed length")
    }
}

/// Human-readable name of a system
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct SystemName(String);

/// Opaque agent auth token presented in the `X-Token` header
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TokenValue(String);

impl TokenValue {
    /// Creates a new random token
    pub fn generate() -> Self {
        Self::try_new(uuid::Uuid::new_v4().simple().to_string()).expect("uuid fits token bounds")
    }
}

/// Agent identity hash bound to a system on first connect
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct FingerprintValue(String);

/// Monotonically increasing monitoring-config epoch per system
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 0
)]
pub struct ConfigVersion(i64);

impl ConfigVersion {
    /// Gets the raw epoch value
    pub fn as_i64(&self) -> i64 {
        self.into_inner()
    }
}

/// Truncated SHA-256 of a canonical config serialization (16 hex chars)
#[nutype(
    validate(len_char_min = 16, len_char_max = 16),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ConfigHash(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_system_ids_are_fifteen_chars() {
        for _ in 0..32 {
            let id = SystemId::generate();
            assert_eq!(id.to_string().chars().count(), SYSTEM_ID_LEN);
        }
    }

    #[test]
    fn system_id_rejects_wrong_length() {
        assert!(SystemId::try_new("short".to_string()).is_err());
        assert!(SystemId::try_new("a".repeat(16)).is_err());
    }

    #[test]
    fn token_rejects_over_64_chars() {
        assert!(TokenValue::try_new("t".repeat(TOKEN_MAX_LEN)).is_ok());
        assert!(TokenValue::try_new("t".repeat(TOKEN_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn config_version_orders_by_epoch() {
        let older = ConfigVersion::try_new(100).unwrap();
        let newer = ConfigVersion::try_new(101).unwrap();
        assert!(newer > older);
    }
}
