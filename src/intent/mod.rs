//! Intent classification and routing.
//!
//! Rule-based registry lookup first (project-level rules from config, then
//! the built-in table); a model-driven fallback over a fixed category set
//! when no rule matches. The classification carries the risk level, the tool
//! allow-list for the turn, and whether planning is required. Conversational
//! categories short-circuit planning entirely.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IntentRuleConfig;
use crate::policy::RiskLevel;
use crate::providers::FailoverChain;
use crate::traits::ChatMessage;

/// Fixed category set. The model fallback must answer with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    CasualChat,
    GeneralChat,
    CapabilityQuery,
    WorkspaceRead,
    WorkspaceEdit,
    CommandRun,
    Research,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::CasualChat => "casual_chat",
            IntentCategory::GeneralChat => "general_chat",
            IntentCategory::CapabilityQuery => "capability_query",
            IntentCategory::WorkspaceRead => "workspace_read",
            IntentCategory::WorkspaceEdit => "workspace_edit",
            IntentCategory::CommandRun => "command_run",
            IntentCategory::Research => "research",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "casual_chat" => Some(IntentCategory::CasualChat),
            "general_chat" => Some(IntentCategory::GeneralChat),
            "capability_query" => Some(IntentCategory::CapabilityQuery),
            "workspace_read" => Some(IntentCategory::WorkspaceRead),
            "workspace_edit" => Some(IntentCategory::WorkspaceEdit),
            "command_run" => Some(IntentCategory::CommandRun),
            "research" => Some(IntentCategory::Research),
            _ => None,
        }
    }

    /// Conversational turns never enter the planner.
    pub fn is_conversational(&self) -> bool {
        matches!(
            self,
            IntentCategory::CasualChat
                | IntentCategory::GeneralChat
                | IntentCategory::CapabilityQuery
        )
    }

    fn default_risk(&self) -> RiskLevel {
        match self {
            IntentCategory::CasualChat
            | IntentCategory::GeneralChat
            | IntentCategory::CapabilityQuery
            | IntentCategory::WorkspaceRead
            | IntentCategory::Research => RiskLevel::Low,
            IntentCategory::WorkspaceEdit => RiskLevel::Medium,
            IntentCategory::CommandRun => RiskLevel::High,
        }
    }

    fn default_planning(&self) -> bool {
        matches!(self, IntentCategory::WorkspaceEdit | IntentCategory::CommandRun)
    }

    fn default_tools(&self) -> Option<Vec<&'static str>> {
        match self {
            IntentCategory::CasualChat
            | IntentCategory::GeneralChat
            | IntentCategory::CapabilityQuery => Some(vec![]),
            IntentCategory::WorkspaceRead => Some(vec!["read_file", "search_files"]),
            IntentCategory::Research => Some(vec!["web_fetch", "read_file", "search_files"]),
            // Full registry for mutating work.
            IntentCategory::WorkspaceEdit | IntentCategory::CommandRun => None,
        }
    }
}

/// Classification outcome for one turn.
#[derive(Debug, Clone)]
pub struct Intent {
    pub name: String,
    pub category: IntentCategory,
    pub confidence: f32,
    pub matched_keywords: Vec<String>,
    /// None means every registered tool is allowed this turn.
    pub allowed_tools: Option<HashSet<String>>,
    pub risk: RiskLevel,
    pub planning_required: bool,
}

impl Intent {
    fn for_category(name: impl Into<String>, category: IntentCategory, confidence: f32) -> Self {
        Self {
            name: name.into(),
            category,
            confidence,
            matched_keywords: Vec::new(),
            allowed_tools: category
                .default_tools()
                .map(|tools| tools.into_iter().map(str::to_string).collect()),
            risk: category.default_risk(),
            planning_required: category.default_planning(),
        }
    }
}

/// One entry in the rule registry.
#[derive(Debug, Clone)]
pub struct IntentRule {
    pub name: String,
    pub keywords: Vec<String>,
    pub category: IntentCategory,
    pub risk: Option<RiskLevel>,
    pub allowed_tools: Option<Vec<String>>,
    pub planning: Option<bool>,
}

impl IntentRule {
    pub fn from_config(config: &IntentRuleConfig) -> anyhow::Result<Self> {
        let category = IntentCategory::from_str(&config.category)
            .ok_or_else(|| anyhow::anyhow!("unknown intent category: {}", config.category))?;
        let risk = match &config.risk {
            Some(s) => Some(
                RiskLevel::from_str(s)
                    .ok_or_else(|| anyhow::anyhow!("unknown risk level: {s}"))?,
            ),
            None => None,
        };
        Ok(Self {
            name: config.name.clone(),
            keywords: config.keywords.clone(),
            category,
            risk,
            allowed_tools: config.tools.clone(),
            planning: config.planning,
        })
    }
}

/// Check if a phrase appears as complete words in text. Splits on
/// whitespace, trims surrounding punctuation (keeping apostrophes), then
/// checks for consecutive word matches. Case-insensitive.
pub fn contains_keyword_as_words(text: &str, keyword: &str) -> bool {
    let normalize = |w: &str| -> String {
        w.trim_matches(|c: char| c.is_ascii_punctuation() && c != '\'')
            .to_lowercase()
    };
    let text_words: Vec<String> = text
        .split_whitespace()
        .map(normalize)
        .filter(|w| !w.is_empty())
        .collect();
    let kw_words: Vec<String> = keyword
        .split_whitespace()
        .map(normalize)
        .filter(|w| !w.is_empty())
        .collect();
    if kw_words.is_empty() {
        return false;
    }
    text_words
        .windows(kw_words.len())
        .any(|window| window == kw_words.as_slice())
}

pub struct IntentClassifier {
    rules: Vec<IntentRule>,
}

impl IntentClassifier {
    /// Project rules first, then the built-in table; first match wins.
    pub fn new(project_rules: Vec<IntentRule>) -> Self {
        let mut rules = project_rules;
        rules.extend(builtin_rules());
        Self { rules }
    }

    /// Rule lookup; None when nothing matched.
    pub fn classify_by_rules(&self, text: &str) -> Option<Intent> {
        for rule in &self.rules {
            let matched: Vec<String> = rule
                .keywords
                .iter()
                .filter(|kw| contains_keyword_as_words(text, kw))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            let mut intent = Intent::for_category(rule.name.clone(), rule.category, 0.9);
            intent.matched_keywords = matched;
            if let Some(risk) = rule.risk {
                intent.risk = risk;
            }
            if let Some(tools) = &rule.allowed_tools {
                intent.allowed_tools = Some(tools.iter().cloned().collect());
            }
            if let Some(planning) = rule.planning {
                intent.planning_required = planning;
            }
            debug!(rule = %intent.name, keywords = ?intent.matched_keywords, "intent rule matched");
            return Some(intent);
        }
        None
    }

    /// Full classification: rules, then the model fallback. A fallback that
    /// cannot be reached or answers off-set degrades to general_chat with
    /// low confidence — a conversational turn is the only safe default.
    pub async fn classify(&self, chain: &FailoverChain, text: &str) -> Intent {
        if let Some(intent) = self.classify_by_rules(text) {
            return intent;
        }

        let categories = [
            "casual_chat",
            "general_chat",
            "capability_query",
            "workspace_read",
            "workspace_edit",
            "command_run",
            "research",
        ];
        let messages = vec![
            ChatMessage::system(format!(
                "Classify the user request into exactly one category. Reply with only the \
                 category token, nothing else. Categories: {}",
                categories.join(", ")
            )),
            ChatMessage::user(text.to_string()),
        ];

        match chain.chat(&messages).await {
            Ok(outcome) => {
                let reply = outcome.response.content.trim().to_lowercase();
                let category = categories
                    .iter()
                    .find(|c| reply.contains(*c))
                    .and_then(|c| IntentCategory::from_str(c));
                match category {
                    Some(category) => {
                        Intent::for_category(format!("model:{}", category.as_str()), category, 0.6)
                    }
                    None => {
                        warn!(reply = %reply, "intent fallback answered off-set");
                        Intent::for_category("fallback:general_chat", IntentCategory::GeneralChat, 0.2)
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "intent fallback unavailable");
                Intent::for_category("fallback:general_chat", IntentCategory::GeneralChat, 0.2)
            }
        }
    }
}

fn builtin_rules() -> Vec<IntentRule> {
    let rule = |name: &str,
                keywords: &[&str],
                category: IntentCategory,
                risk: Option<RiskLevel>|
     -> IntentRule {
        IntentRule {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            category,
            risk,
            allowed_tools: None,
            planning: None,
        }
    };

    vec![
        rule(
            "capability_query",
            &[
                "what can you do",
                "which tools",
                "list your tools",
                "your capabilities",
            ],
            IntentCategory::CapabilityQuery,
            None,
        ),
        rule(
            "casual_chat",
            &["hello", "hi there", "thanks", "thank you", "good morning"],
            IntentCategory::CasualChat,
            None,
        ),
        rule(
            "deploy_release",
            &["deploy", "release", "publish", "push to production"],
            IntentCategory::CommandRun,
            Some(RiskLevel::High),
        ),
        rule(
            "run_build",
            &["run the tests", "build the project", "compile", "run command"],
            IntentCategory::CommandRun,
            Some(RiskLevel::Medium),
        ),
        rule(
            "workspace_edit",
            &[
                "fix", "refactor", "implement", "rewrite", "create a file", "edit", "rename",
                "add a",
            ],
            IntentCategory::WorkspaceEdit,
            None,
        ),
        rule(
            "workspace_read",
            &["read", "show me", "list the files", "search for", "find", "look at"],
            IntentCategory::WorkspaceRead,
            None,
        ),
        rule(
            "research",
            &["look up", "research", "documentation for", "fetch the page"],
            IntentCategory::Research,
            None,
        ),
    ]
}
