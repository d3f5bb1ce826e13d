//! Token accounting.
//!
//! Counts are never authoritative across providers: the same history counted
//! under two providers may legitimately differ, so every estimate carries the
//! identity of the provider that produced it and is never cached or compared
//! cross-provider.

use crate::providers::{heuristic_tokens, ProviderClient};
use crate::session::types::Turn;

use serde::{Deserialize, Serialize};

/// A history-wide estimate attributed to one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Provider that produced the count.
    pub provider: String,
    pub model: String,
    pub total: u32,
    /// Heuristic per-turn breakdown. Backends with exact counters only
    /// measure whole histories, so the split is always approximate.
    pub per_turn: Vec<u32>,
}

/// Budget view reported through `Session::token_info`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    pub total: u32,
    pub remaining: u32,
    pub max: u32,
}

impl TokenInfo {
    /// `remaining` floors at zero; the budget may be exceeded and
    /// enforcement, if any, belongs to the caller.
    pub fn new(total: u32, max: u32) -> Self {
        Self {
            total,
            remaining: max.saturating_sub(total),
            max,
        }
    }
}

/// Measures a history under one provider's counting strategy.
pub struct TokenAccountant;

impl TokenAccountant {
    pub async fn estimate(provider: &dyn ProviderClient, history: &[Turn]) -> TokenUsage {
        let total = provider.count_tokens(history).await;
        let per_turn = history
            .iter()
            .map(|turn| heuristic_tokens(std::slice::from_ref(turn)))
            .collect();
        TokenUsage {
            provider: provider.name().to_string(),
            model: provider.model().to_string(),
            total,
            per_turn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai::OpenAiProvider;

    #[test]
    fn remaining_floors_at_zero() {
        let info = TokenInfo::new(40_000, 32_768);
        assert_eq!(info.remaining, 0);
        assert_eq!(info.total, 40_000);

        let info = TokenInfo::new(100, 32_768);
        assert_eq!(info.remaining, 32_668);
    }

    #[tokio::test]
    async fn estimate_is_attributed_to_the_provider() {
        let provider = OpenAiProvider::new("sk-test1234567890".into(), None, None);
        let history = vec![Turn::user("hello out there")];

        let usage = TokenAccountant::estimate(&provider, &history).await;
        assert_eq!(usage.provider, "openai");
        assert_eq!(usage.model, "gpt-4o-mini");
        assert_eq!(usage.per_turn.len(), 1);
        assert!(usage.total > 0);
    }

    #[tokio::test]
    async fn estimate_grows_with_the_history() {
        let provider = OpenAiProvider::new("sk-test1234567890".into(), None, None);
        let mut history = Vec::new();
        let mut last = 0;
        for i in 0..6 {
            history.push(Turn::user(format!("message body number {i}")));
            let usage = TokenAccountant::estimate(&provider, &history).await;
            assert!(usage.total >= last);
            last = usage.total;
        }
    }
}
