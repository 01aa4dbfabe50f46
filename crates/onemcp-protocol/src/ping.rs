//! Ping and the empty result shared by void methods.

use serde::{Deserialize, Serialize};

/// The empty object result returned by `ping`, `resources/subscribe` and
/// friends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyResult {}

impl EmptyResult {
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_empty_object() {
        assert_eq!(serde_json::to_string(&EmptyResult::new()).unwrap(), "{}");
    }
}
