//! ID wrapper types for type-safe identifiers.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque handle for a context held by a [`ContextRegistry`](crate::ContextRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Ulid);

impl ContextId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContextId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id_display_round_trip() {
        let id = ContextId::new();
        let parsed: ContextId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(parsed.as_ulid(), id.as_ulid());
    }

    #[test]
    fn test_context_id_rejects_garbage() {
        assert!("not-a-ulid".parse::<ContextId>().is_err());
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::default());
    }
}
