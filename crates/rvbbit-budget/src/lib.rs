//! # RVBBIT Token Budgeter
//!
//! Enforces `current_tokens + reserve_for_output ≤ max_total` for a message
//! list before each LLM call.
//!
//! Token counting uses tiktoken where a model-family encoder resolves and a
//! `len/4` heuristic otherwise, so budgets are approximate by design. The
//! tokenizer is chosen per model family; message overhead is 4 tokens per
//! message plus a 3-token base for the array.
//!
//! Strategies:
//! - `sliding_window` — keep the leading system message, then greedily accept
//!   messages from the tail until the next one would exceed the budget.
//! - `prune_oldest` — drop the oldest non-critical messages until fit.
//!   Critical: system messages, the last three user/assistant turns, and any
//!   message whose content mentions `error` or `route_to`.
//! - `summarize` — replace everything before the last 10 messages with a
//!   single synthesized system summary from a secondary model.
//! - `fail` — raise [`rvbbit_core::Error::TokenBudgetExceeded`] with the
//!   computed breakdown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use rvbbit_core::config::{BudgetStrategy, TokenBudgetSpec};
use rvbbit_core::{Error, Message, Result, Role};

const TOKENS_PER_MESSAGE: usize = 4;
const BASE_OVERHEAD: usize = 3;
const KEEP_RECENT_TURNS: usize = 3;
const SUMMARIZE_KEEP_TAIL: usize = 10;

/// Secondary-model hook for the `summarize` strategy.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String>;
}

/// Result of a budget check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub current: usize,
    pub limit: usize,
    pub reserve: usize,
    pub percentage: f64,
    pub over: bool,
    pub warning: bool,
}

/// Counts tokens and enforces a budget for one model.
pub struct TokenBudgeter {
    model: String,
    max_total: usize,
    reserve_for_output: usize,
    strategy: BudgetStrategy,
    encoder: Option<CoreBPE>,
}

impl std::fmt::Debug for TokenBudgeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgeter")
            .field("model", &self.model)
            .field("max_total", &self.max_total)
            .field("reserve_for_output", &self.reserve_for_output)
            .field("strategy", &self.strategy)
            .field("encoder", &self.encoder.is_some())
            .finish()
    }
}

impl TokenBudgeter {
    pub fn new(
        model: impl Into<String>,
        max_total: usize,
        reserve_for_output: usize,
        strategy: BudgetStrategy,
    ) -> Result<Self> {
        if max_total <= reserve_for_output {
            return Err(Error::config(
                "token_budget.max_total",
                format!("max_total ({max_total}) must exceed reserve_for_output ({reserve_for_output})"),
            ));
        }
        let model = model.into();
        Ok(Self {
            encoder: resolve_encoder(&model),
            model,
            max_total,
            reserve_for_output,
            strategy,
        })
    }

    /// Build from a cascade's `token_budget` block. `default_model` supplies
    /// the tokenizer when the spec names none.
    pub fn from_spec(spec: &TokenBudgetSpec, default_model: &str) -> Result<Self> {
        Self::new(
            spec.model.as_deref().unwrap_or(default_model),
            spec.max_total,
            spec.reserve_for_output,
            spec.strategy,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn strategy(&self) -> BudgetStrategy {
        self.strategy
    }

    /// Budget available to the prompt (limit minus output reserve).
    pub fn available(&self) -> usize {
        self.max_total.saturating_sub(self.reserve_for_output)
    }

    /// Count tokens in a raw string.
    pub fn count_text(&self, text: &str) -> usize {
        match &self.encoder {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }

    fn count_message(&self, message: &Message) -> usize {
        let mut tokens = self.count_text(&message.content) + TOKENS_PER_MESSAGE;
        for call in &message.tool_calls {
            tokens += self.count_text(&call.name);
            tokens += self.count_text(&call.args.to_string());
        }
        tokens
    }

    /// Count tokens of a message list, including structural overhead.
    pub fn count(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.count_message(m))
            .sum::<usize>()
            + BASE_OVERHEAD
    }

    /// Compare a message list against the budget.
    pub fn check(&self, messages: &[Message]) -> BudgetCheck {
        let current = self.count(messages);
        let available = self.available();
        BudgetCheck {
            current,
            limit: self.max_total,
            reserve: self.reserve_for_output,
            percentage: current as f64 / available.max(1) as f64,
            over: current > available,
            warning: current * 10 > available * 8,
        }
    }

    /// Enforce the budget with the configured strategy. The async
    /// `summarize` strategy degrades to `sliding_window` here; use
    /// [`TokenBudgeter::enforce_with`] to provide a summarizer.
    pub fn enforce(&self, messages: &[Message]) -> Result<Vec<Message>> {
        if !self.check(messages).over {
            return Ok(messages.to_vec());
        }
        match self.strategy {
            BudgetStrategy::SlidingWindow => Ok(self.sliding_window(messages)),
            BudgetStrategy::PruneOldest => Ok(self.prune_oldest(messages)),
            BudgetStrategy::Summarize => {
                tracing::warn!("summarize strategy without a summarizer; using sliding window");
                Ok(self.sliding_window(messages))
            }
            BudgetStrategy::Fail => Err(Error::TokenBudgetExceeded {
                current: self.count(messages),
                reserve: self.reserve_for_output,
                limit: self.max_total,
            }),
        }
    }

    /// Enforce, with an optional summarizer for the `summarize` strategy.
    pub async fn enforce_with(
        &self,
        messages: &[Message],
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<Vec<Message>> {
        if !self.check(messages).over {
            return Ok(messages.to_vec());
        }
        match (self.strategy, summarizer) {
            (BudgetStrategy::Summarize, Some(s)) => self.summarize(messages, s).await,
            _ => self.enforce(messages),
        }
    }

    fn sliding_window(&self, messages: &[Message]) -> Vec<Message> {
        let available = self.available();
        let (system, rest): (Option<&Message>, &[Message]) =
            match messages.first() {
                Some(m) if m.is_system() => (Some(m), &messages[1..]),
                _ => (None, messages),
            };

        let mut used = BASE_OVERHEAD;
        let mut result = Vec::new();
        if let Some(sys) = system {
            used += self.count_message(sys);
            result.push(sys.clone());
        }

        let mut tail: Vec<&Message> = Vec::new();
        for msg in rest.iter().rev() {
            let tokens = self.count_message(msg);
            if used + tokens > available {
                break;
            }
            used += tokens;
            tail.push(msg);
        }
        tail.reverse();
        result.extend(tail.into_iter().cloned());
        result
    }

    fn prune_oldest(&self, messages: &[Message]) -> Vec<Message> {
        let available = self.available();
        let critical = critical_indexes(messages);

        let mut kept: Vec<Option<&Message>> = messages.iter().map(Some).collect();
        let mut current = self.count(messages);

        for (i, msg) in messages.iter().enumerate() {
            if current <= available {
                break;
            }
            if critical.contains(&i) {
                continue;
            }
            kept[i] = None;
            current -= self.count_message(msg);
        }

        kept.into_iter().flatten().cloned().collect()
    }

    async fn summarize(
        &self,
        messages: &[Message],
        summarizer: &dyn Summarizer,
    ) -> Result<Vec<Message>> {
        if messages.len() <= SUMMARIZE_KEEP_TAIL {
            return Ok(self.sliding_window(messages));
        }
        let split = messages.len() - SUMMARIZE_KEEP_TAIL;
        let (head, tail) = messages.split_at(split);

        let transcript: String = head
            .iter()
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();
        let summary = summarizer.summarize(&transcript).await?;

        let mut result = Vec::with_capacity(tail.len() + 1);
        result.push(Message::system(format!(
            "Summary of earlier conversation: {summary}"
        )));
        result.extend(tail.iter().cloned());

        // The summary itself may still blow the budget.
        if self.check(&result).over {
            return Ok(self.sliding_window(&result));
        }
        Ok(result)
    }
}

/// Indexes that `prune_oldest` must keep: system messages, the last three
/// user/assistant turns, and anything mentioning "error" or "route_to".
fn critical_indexes(messages: &[Message]) -> std::collections::HashSet<usize> {
    let mut critical = std::collections::HashSet::new();
    let mut recent = 0;
    for (i, msg) in messages.iter().enumerate().rev() {
        if matches!(msg.role, Role::User | Role::Assistant) && recent < KEEP_RECENT_TURNS {
            critical.insert(i);
            recent += 1;
        }
    }
    for (i, msg) in messages.iter().enumerate() {
        if msg.is_system()
            || msg.content.contains("error")
            || msg.content.contains("route_to")
        {
            critical.insert(i);
        }
    }
    critical
}

fn resolve_encoder(model: &str) -> Option<CoreBPE> {
    if let Ok(bpe) = tiktoken_rs::get_bpe_from_model(model) {
        return Some(bpe);
    }
    let lower = model.to_lowercase();
    if lower.contains("gpt-4") || lower.contains("gpt4") {
        return tiktoken_rs::get_bpe_from_model("gpt-4").ok();
    }
    if lower.contains("gpt-3.5") {
        return tiktoken_rs::get_bpe_from_model("gpt-3.5-turbo").ok();
    }
    // Reasonable default for unknown chat models.
    tiktoken_rs::cl100k_base().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgeter(max_total: usize, reserve: usize, strategy: BudgetStrategy) -> TokenBudgeter {
        TokenBudgeter::new("gpt-4", max_total, reserve, strategy).unwrap()
    }

    fn conversation(n_pairs: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("You are a helpful assistant")];
        for i in 0..n_pairs {
            msgs.push(Message::user(format!(
                "question number {i} with a little bit of padding text"
            )));
            msgs.push(Message::assistant(format!(
                "answer number {i} with a little bit of padding text"
            )));
        }
        msgs
    }

    #[test]
    fn constructor_rejects_budget_at_or_below_reserve() {
        assert!(TokenBudgeter::new("gpt-4", 100, 100, BudgetStrategy::Fail).is_err());
        assert!(TokenBudgeter::new("gpt-4", 100, 200, BudgetStrategy::Fail).is_err());
        assert!(TokenBudgeter::new("gpt-4", 100, 50, BudgetStrategy::Fail).is_ok());
    }

    #[test]
    fn count_includes_overheads() {
        let b = budgeter(10_000, 100, BudgetStrategy::SlidingWindow);
        assert_eq!(b.count(&[]), BASE_OVERHEAD);
        let one = b.count(&[Message::user("hi")]);
        assert!(one > BASE_OVERHEAD + TOKENS_PER_MESSAGE);
    }

    #[test]
    fn count_includes_tool_calls() {
        let b = budgeter(10_000, 100, BudgetStrategy::SlidingWindow);
        let plain = Message::assistant("run it");
        let with_call = Message::assistant_with_tools(
            "run it",
            vec![rvbbit_core::ToolCall::new(
                "c1",
                "shell",
                serde_json::json!({"command": "ls -la /tmp"}),
            )],
        );
        assert!(b.count(&[with_call]) > b.count(&[plain]));
    }

    #[test]
    fn check_reports_over_and_warning() {
        let b = budgeter(40, 10, BudgetStrategy::SlidingWindow);
        let check = b.check(&conversation(10));
        assert!(check.over);
        assert!(check.warning);
        assert_eq!(check.limit, 40);
        assert_eq!(check.reserve, 10);
    }

    #[test]
    fn sliding_window_keeps_system_and_fits() {
        let b = budgeter(120, 20, BudgetStrategy::SlidingWindow);
        let msgs = conversation(30);
        let pruned = b.enforce(&msgs).unwrap();

        assert!(pruned.len() < msgs.len());
        assert!(pruned[0].is_system(), "system message must be preserved");
        assert!(b.count(&pruned) + b.reserve_for_output <= b.max_total);
        // The most recent pair survives.
        let last = msgs.last().unwrap();
        assert!(pruned.iter().any(|m| m.content == last.content));
    }

    #[test]
    fn enforce_is_identity_when_under_budget() {
        let b = budgeter(100_000, 1000, BudgetStrategy::Fail);
        let msgs = conversation(3);
        assert_eq!(b.enforce(&msgs).unwrap(), msgs);
    }

    #[test]
    fn fail_strategy_raises_with_breakdown() {
        let b = budgeter(40, 10, BudgetStrategy::Fail);
        let err = b.enforce(&conversation(10)).unwrap_err();
        match err {
            Error::TokenBudgetExceeded { current, reserve, limit } => {
                assert!(current > 30);
                assert_eq!(reserve, 10);
                assert_eq!(limit, 40);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn prune_oldest_keeps_critical_messages() {
        let b = budgeter(150, 20, BudgetStrategy::PruneOldest);
        let mut msgs = conversation(20);
        msgs.insert(
            5,
            Message::assistant("tool returned an error: connection refused"),
        );
        let pruned = b.enforce(&msgs).unwrap();

        assert!(pruned[0].is_system());
        assert!(
            pruned.iter().any(|m| m.content.contains("error")),
            "messages mentioning errors are critical"
        );
        // Last three user/assistant turns survive.
        let tail: Vec<&str> = msgs
            .iter()
            .rev()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .take(3)
            .map(|m| m.content.as_str())
            .collect();
        for content in tail {
            assert!(pruned.iter().any(|m| m.content == content));
        }
    }

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, transcript: &str) -> Result<String> {
            assert!(!transcript.is_empty());
            Ok("they discussed many questions".to_string())
        }
    }

    #[tokio::test]
    async fn summarize_replaces_head_with_synthetic_system() {
        let b = budgeter(400, 50, BudgetStrategy::Summarize);
        let msgs = conversation(30);
        let result = b.enforce_with(&msgs, Some(&FixedSummarizer)).await.unwrap();

        assert!(result[0].is_system());
        assert!(result[0].content.contains("Summary of earlier conversation"));
        assert!(result.len() <= SUMMARIZE_KEEP_TAIL + 1);
        // Tail comes through verbatim.
        let last = msgs.last().unwrap();
        assert_eq!(result.last().unwrap().content, last.content);
    }

    #[test]
    fn from_spec_uses_default_model_when_unset() {
        let spec = TokenBudgetSpec {
            max_total: 30_000,
            reserve_for_output: 2_000,
            strategy: BudgetStrategy::SlidingWindow,
            model: None,
        };
        let b = TokenBudgeter::from_spec(&spec, "gpt-4o").unwrap();
        assert_eq!(b.model(), "gpt-4o");
        assert_eq!(b.available(), 28_000);
    }

    #[test]
    fn unknown_model_still_counts() {
        let b = TokenBudgeter::new("mystery-lm-9000", 1000, 100, BudgetStrategy::SlidingWindow)
            .unwrap();
        assert!(b.count_text("hello world, how are you?") > 0);
    }
}
