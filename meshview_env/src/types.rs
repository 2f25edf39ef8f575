//! Identifier types shared by the MeshView crates.

use serde::{Deserialize, Serialize};
use uuid::{Builder, Uuid};

use crate::random::RandomSource;

/// Defines a UUID-backed identifier.
///
/// Ids can be random (`new`), drawn from a [`RandomSource`] (`generate`, used
/// by the engine so seeded runs produce identical ids), or derived from a
/// plain seed (`from_seed`, for fixtures).
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Draws a v4 id from the given source.
            pub fn generate<R: RandomSource + ?Sized>(rng: &mut R) -> Self {
                let mut bytes = [0u8; 16];
                rng.fill_bytes(&mut bytes);
                Self(Builder::from_random_bytes(bytes).into_uuid())
            }

            /// Creates a deterministic id from a seed.
            pub fn from_seed(seed: u64) -> Self {
                let mut bytes = [0u8; 16];
                bytes[0..8].copy_from_slice(&seed.to_le_bytes());
                bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
                Self(Uuid::from_bytes(bytes))
            }

            /// Returns the inner UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// First eight hex digits, for log lines and traceable names.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a user or system account.
    AccountId
);

uuid_id!(
    /// Identifies a build or deploy job.
    JobId
);

uuid_id!(
    /// Identifies one run of the experiment executor over a batch.
    ExecutionId
);

uuid_id!(
    /// Identifies a generated scenario batch.
    BatchId
);

uuid_id!(
    /// Identifies an archived experiment result.
    ResultId
);

uuid_id!(
    /// Identifies a synthesized inter-node packet event.
    PacketId
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn test_generate_is_deterministic_per_seed() {
        let mut a = SeededRandom::new(42);
        let mut b = SeededRandom::new(42);
        assert_eq!(AccountId::generate(&mut a), AccountId::generate(&mut b));
    }

    #[test]
    fn test_generated_ids_are_v4() {
        let mut rng = SeededRandom::new(1);
        let id = JobId::generate(&mut rng);
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn test_short_is_eight_hex_chars() {
        let id = BatchId::from_seed(7);
        let short = id.short();
        assert_eq!(short.len(), 8);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.to_string().replace('-', "").starts_with(&short));
    }

    #[test]
    fn test_from_seed_distinct() {
        assert_ne!(ResultId::from_seed(1), ResultId::from_seed(2));
        assert_eq!(ResultId::from_seed(3), ResultId::from_seed(3));
    }
}
