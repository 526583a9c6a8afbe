//! Token-budgeted conversation context.
//!
//! The manager owns an append-only log of [`ContextItem`]s and is the only
//! code that mutates them — the executor appends through this API and never
//! touches items directly. When the estimated total crosses the configured
//! fraction of the model window, compaction partitions items into
//! `{protected ∪ most-recent N turns}` (kept verbatim) and the remainder,
//! then shrinks the remainder toward `window - completion_reserve` with
//! progressively more aggressive strategies. Protected items are never
//! evicted or compressed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContextConfig;
use crate::traits::ChatMessage;
use crate::utils::{estimate_tokens, truncate_str};

/// Eviction priority, highest survival first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Protected,
    Recent,
    Working,
    Relevant,
    Archival,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::Protected => "protected",
            PriorityTier::Recent => "recent",
            PriorityTier::Working => "working",
            PriorityTier::Relevant => "relevant",
            PriorityTier::Archival => "archival",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    System,
    User,
    Assistant,
    ToolResult,
}

impl ItemCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::System => "system",
            ItemCategory::User => "user",
            ItemCategory::Assistant => "assistant",
            ItemCategory::ToolResult => "tool_result",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: u64,
    pub content: String,
    pub tier: PriorityTier,
    pub token_count: usize,
    pub category: ItemCategory,
    pub created_at: DateTime<Utc>,
    pub protected: bool,
}

/// What one compaction pass did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionReport {
    pub before_tokens: usize,
    pub after_tokens: usize,
    pub target: usize,
    pub compressed: usize,
    pub evicted: usize,
}

pub struct ContextManager {
    items: Vec<ContextItem>,
    next_id: u64,
    window_tokens: usize,
    compact_threshold: f32,
    completion_reserve: usize,
    keep_recent_turns: usize,
}

impl ContextManager {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
            window_tokens: config.window_tokens,
            compact_threshold: config.compact_threshold,
            completion_reserve: config.completion_reserve,
            keep_recent_turns: config.keep_recent_turns,
        }
    }

    /// System prompt: protected, never evicted or compressed.
    pub fn push_system(&mut self, content: impl Into<String>) -> u64 {
        self.append(ItemCategory::System, content, PriorityTier::Protected, true)
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> u64 {
        self.append(ItemCategory::User, content, PriorityTier::Recent, false)
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) -> u64 {
        self.append(ItemCategory::Assistant, content, PriorityTier::Recent, false)
    }

    pub fn push_tool_result(&mut self, content: impl Into<String>) -> u64 {
        self.append(ItemCategory::ToolResult, content, PriorityTier::Working, false)
    }

    fn append(
        &mut self,
        category: ItemCategory,
        content: impl Into<String>,
        tier: PriorityTier,
        protected: bool,
    ) -> u64 {
        let content = content.into();
        let id = self.next_id;
        self.next_id += 1;
        self.items.push(ContextItem {
            id,
            token_count: estimate_tokens(&content),
            content,
            tier,
            category,
            created_at: Utc::now(),
            protected,
        });
        id
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.token_count).sum()
    }

    pub fn should_compact(&self) -> bool {
        let threshold = (self.window_tokens as f32 * self.compact_threshold) as usize;
        self.total_tokens() >= threshold
    }

    /// Target budget after compaction: the window minus the completion
    /// reserve kept free for the model's reply.
    pub fn target_tokens(&self) -> usize {
        self.window_tokens.saturating_sub(self.completion_reserve)
    }

    /// One compaction pass. Keeps protected items and the most recent
    /// `keep_recent_turns` turns verbatim; everything else is compressed in
    /// escalating stages, then evicted oldest-first if stages were not
    /// enough. Never removes the keep set, even if the target is still
    /// exceeded afterward.
    pub fn compact(&mut self) -> CompactionReport {
        let before_tokens = self.total_tokens();
        let target = self.target_tokens();
        let keep = self.keep_set();

        let mut compressed = 0;

        for stage in [
            Strategy::Light,
            Strategy::Medium,
            Strategy::Heavy,
            Strategy::Emergency,
        ] {
            if self.total_tokens() <= target {
                break;
            }
            // Budget left for candidates once the keep set is paid for.
            let keep_tokens: usize = self
                .items
                .iter()
                .filter(|i| keep.contains(&i.id))
                .map(|i| i.token_count)
                .sum();
            let candidate_budget = target.saturating_sub(keep_tokens);
            let candidate_tokens: usize = self
                .items
                .iter()
                .filter(|i| !keep.contains(&i.id))
                .map(|i| i.token_count)
                .sum();
            if candidate_tokens == 0 {
                break;
            }
            let ratio = candidate_budget as f32 / candidate_tokens as f32;

            // A generous budget means the gentle stage may be all we need;
            // skip ahead when the ratio says gentler stages cannot get there.
            if stage.too_gentle_for(ratio) {
                continue;
            }

            for item in self.items.iter_mut().filter(|i| !keep.contains(&i.id)) {
                let shrunk = stage.apply(item);
                if shrunk {
                    compressed += 1;
                }
            }
            if self.total_tokens() <= target {
                break;
            }
        }

        // Last resort: evict whole candidates oldest-first.
        let mut evicted = 0;
        while self.total_tokens() > target {
            let Some(pos) = self.items.iter().position(|i| !keep.contains(&i.id)) else {
                break; // only the keep set remains
            };
            self.items.remove(pos);
            evicted += 1;
        }

        CompactionReport {
            before_tokens,
            after_tokens: self.total_tokens(),
            target,
            compressed,
            evicted,
        }
    }

    /// Ids kept verbatim: every protected item plus the user and assistant
    /// items of the most recent `keep_recent_turns` exchanges. Tool results
    /// stay compressible even inside a recent turn — a single turn with
    /// dozens of large results must still be reducible. At minimum the last
    /// exchange survives.
    fn keep_set(&self) -> std::collections::HashSet<u64> {
        let mut keep: std::collections::HashSet<u64> =
            self.items.iter().filter(|i| i.protected).map(|i| i.id).collect();

        let turns = self.keep_recent_turns.max(1);
        for category in [ItemCategory::User, ItemCategory::Assistant] {
            for item in self
                .items
                .iter()
                .rev()
                .filter(|i| i.category == category)
                .take(turns)
            {
                keep.insert(item.id);
            }
        }
        keep
    }

    /// Ordered messages for a provider call. Tool results are folded into
    /// user-role messages since the wire client speaks plain chat turns.
    ///
    /// Providers require assistant turns to follow a user message; after
    /// eviction the window could otherwise open with a stranded assistant
    /// reply, so leading assistant items before the first user anchor are
    /// skipped.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let anchor = self
            .items
            .iter()
            .position(|i| i.category == ItemCategory::User)
            .unwrap_or(0);
        self.items
            .iter()
            .enumerate()
            .filter(|(pos, item)| {
                *pos >= anchor || item.category != ItemCategory::Assistant
            })
            .map(|(_, item)| match item.category {
                ItemCategory::System => ChatMessage::system(item.content.clone()),
                ItemCategory::User => ChatMessage::user(item.content.clone()),
                ItemCategory::Assistant => ChatMessage::assistant(item.content.clone()),
                ItemCategory::ToolResult => {
                    ChatMessage::user(format!("[tool result]\n{}", item.content))
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Light,
    Medium,
    Heavy,
    Emergency,
}

impl Strategy {
    /// Whether this stage is too gentle to matter for the given ratio of
    /// available candidate budget to candidate size.
    fn too_gentle_for(&self, ratio: f32) -> bool {
        match self {
            Strategy::Light => ratio < 0.5,
            Strategy::Medium => ratio < 0.2,
            Strategy::Heavy => ratio < 0.05,
            Strategy::Emergency => false,
        }
    }

    /// Apply to one candidate item; returns true if it shrank.
    fn apply(&self, item: &mut ContextItem) -> bool {
        let replacement = match self {
            Strategy::Light => compress_light(&item.content),
            Strategy::Medium => compress_medium(&item.content),
            Strategy::Heavy => compress_heavy(&item.content),
            Strategy::Emergency => compress_emergency(item),
        };
        let new_tokens = estimate_tokens(&replacement);
        if new_tokens < item.token_count {
            item.content = replacement;
            item.token_count = new_tokens;
            true
        } else {
            false
        }
    }
}

/// Collapse whitespace runs and cap very long content.
fn compress_light(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0;
    for line in content.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    truncate_with_marker(out.trim_end(), 2000)
}

/// Sentence extraction: opening and closing sentences with the middle elided.
fn compress_medium(content: &str) -> String {
    let sentences: Vec<&str> = content
        .split_inclusive(&['.', '!', '?', '\n'][..])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if sentences.len() <= 4 {
        return truncate_with_marker(content, 600);
    }
    let head = sentences[..2].join(" ");
    let tail = sentences[sentences.len() - 2..].join(" ");
    format!("{head} [...] {tail}")
}

/// Keyword digest: most frequent distinctive words.
fn compress_heavy(content: &str) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in content
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '/')
        .filter(|w| w.len() > 4)
    {
        *counts.entry(word.to_lowercase()).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let keywords: Vec<String> = ranked.into_iter().take(12).map(|(w, _)| w).collect();
    if keywords.is_empty() {
        return truncate_str(content, 60);
    }
    format!("digest: {}", keywords.join(", "))
}

/// Category tag only — the content itself is gone.
fn compress_emergency(item: &ContextItem) -> String {
    format!(
        "[{}: {} tokens elided]",
        item.category.as_str(),
        item.token_count
    )
}

fn truncate_with_marker(content: &str, max_chars: usize) -> String {
    crate::utils::truncate_with_note(content, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: usize) -> ContextConfig {
        ContextConfig {
            window_tokens: window,
            compact_threshold: 0.7,
            completion_reserve: window / 8,
            keep_recent_turns: 2,
        }
    }

    fn filler(words: usize) -> String {
        (0..words)
            .map(|i| format!("payload{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_should_compact_at_threshold() {
        let mut ctx = ContextManager::new(&config(1000));
        ctx.push_system("system prompt");
        assert!(!ctx.should_compact());
        ctx.push_user(filler(800));
        assert!(ctx.should_compact());
    }

    #[test]
    fn test_protected_item_byte_identical_after_compaction() {
        let mut ctx = ContextManager::new(&config(2000));
        let system = "You are a careful workspace agent. Never lose this prompt.";
        ctx.push_system(system);
        for _ in 0..40 {
            ctx.push_user(filler(30));
            ctx.push_tool_result(filler(60));
        }
        ctx.compact();
        let kept: Vec<&ContextItem> = ctx
            .items()
            .iter()
            .filter(|i| i.category == ItemCategory::System)
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, system);
    }

    #[test]
    fn test_compaction_reaches_target_with_enough_mass() {
        let mut ctx = ContextManager::new(&config(2000));
        ctx.push_system("system");
        for _ in 0..40 {
            ctx.push_user(filler(20));
            ctx.push_tool_result(filler(80));
        }
        assert!(ctx.total_tokens() > ctx.target_tokens());
        let report = ctx.compact();
        assert!(report.after_tokens <= report.target);
        assert!(report.compressed > 0 || report.evicted > 0);
    }

    #[test]
    fn test_most_recent_exchange_survives() {
        let mut ctx = ContextManager::new(&config(500));
        ctx.push_system("system");
        for i in 0..30 {
            ctx.push_user(format!("question {i} {}", filler(40)));
            ctx.push_assistant(format!("answer {i} {}", filler(40)));
        }
        let last_user = "final question with unique marker zebra";
        let last_answer = "final answer with unique marker yak";
        ctx.push_user(last_user);
        ctx.push_assistant(last_answer);
        ctx.compact();
        let all: String = ctx.items().iter().map(|i| i.content.as_str()).collect();
        assert!(all.contains("zebra"));
        assert!(all.contains("yak"));
    }

    #[test]
    fn test_emergency_leaves_category_tag() {
        let item = ContextItem {
            id: 1,
            content: filler(100),
            tier: PriorityTier::Working,
            token_count: 100,
            category: ItemCategory::ToolResult,
            created_at: Utc::now(),
            protected: false,
        };
        let tag = compress_emergency(&item);
        assert!(tag.contains("tool_result"));
        assert!(tag.contains("elided"));
    }

    #[test]
    fn test_light_collapses_blank_runs() {
        let out = compress_light("a\n\n\n\nb");
        assert_eq!(out, "a\n\nb");
    }

    #[test]
    fn test_medium_extracts_head_and_tail() {
        let text = "First point. Second point. Third point. Fourth point. \
                    Fifth point. Last point.";
        let out = compress_medium(text);
        assert!(out.contains("First point."));
        assert!(out.contains("Last point."));
        assert!(out.contains("[...]"));
    }

    #[test]
    fn test_heavy_produces_keyword_digest() {
        let text = "deployment deployment deployment pipeline pipeline failure";
        let out = compress_heavy(text);
        assert!(out.starts_with("digest:"));
        assert!(out.contains("deployment"));
    }

    #[test]
    fn test_to_messages_maps_roles() {
        let mut ctx = ContextManager::new(&config(1000));
        ctx.push_system("sys");
        ctx.push_user("hi");
        ctx.push_tool_result("output");
        let messages = ctx.to_messages();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert!(messages[2].content.starts_with("[tool result]"));
    }

    #[test]
    fn test_to_messages_skips_stranded_leading_assistant() {
        let mut ctx = ContextManager::new(&config(1000));
        ctx.push_system("sys");
        // Eviction can leave an assistant reply with no preceding user turn.
        ctx.push_assistant("orphaned reply");
        ctx.push_user("next question");
        let messages = ctx.to_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn test_example_scenario_protected_survives_heavy_pressure() {
        // 1 protected item + 40 working items against a small budget.
        let mut ctx = ContextManager::new(&config(2000));
        let system = "protected system prompt";
        ctx.push_system(system);
        ctx.push_user("kick off");
        for _ in 0..40 {
            ctx.push_tool_result(filler(75));
        }
        ctx.compact();
        assert!(ctx
            .items()
            .iter()
            .any(|i| i.protected && i.content == system));
    }
}
