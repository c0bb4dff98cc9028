use std::collections::HashMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Contract;
use crate::snapshot::Snapshot;

/// Outcome of a scan: may the task be dispatched right now?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    NeedInfo,
    Conflict,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "PROCEED"),
            Self::NeedInfo => write!(f, "NEED_INFO"),
            Self::Conflict => write!(f, "CONFLICT"),
        }
    }
}

/// A scan decision with its supporting detail. Poll results are structured
/// decisions, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub decision: Decision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_with: Option<String>,
}

impl PollResult {
    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Proceed,
            reason: reason.into(),
            missing: vec![],
            conflict_with: None,
        }
    }

    pub fn need_info(reason: impl Into<String>, missing: Vec<String>) -> Self {
        Self {
            decision: Decision::NeedInfo,
            reason: reason.into(),
            missing,
            conflict_with: None,
        }
    }

    pub fn conflict(reason: impl Into<String>, with: impl Into<String>) -> Self {
        Self {
            decision: Decision::Conflict,
            reason: reason.into(),
            missing: vec![],
            conflict_with: Some(with.into()),
        }
    }
}

/// The scan gate between eligibility and dispatch.
pub trait Poller: Send + Sync {
    fn poll(&self, task_id: &str, snapshot: &Snapshot) -> PollResult;
}

// ---------------------------------------------------------------------------
// Contract poller
// ---------------------------------------------------------------------------

/// How consumed entries are matched against published entanglements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum MatchMode {
    /// `kind:package:name`
    #[default]
    Exact,
    /// `kind:name`
    NameOnly,
}

/// Deterministic scan over statically derived task contracts.
pub struct ContractPoller {
    contracts: HashMap<String, Contract>,
    mode: MatchMode,
}

impl ContractPoller {
    pub fn new(contracts: HashMap<String, Contract>, mode: MatchMode) -> Self {
        Self { contracts, mode }
    }

    /// Collect the contract hints carried by task descriptors. Tasks
    /// without a contract fall open at poll time.
    pub fn from_specs(specs: &[crate::model::TaskSpec], mode: MatchMode) -> Self {
        let contracts = specs
            .iter()
            .filter_map(|spec| {
                spec.contract
                    .clone()
                    .map(|contract| (spec.id.clone(), contract))
            })
            .collect();
        Self::new(contracts, mode)
    }
}

impl Poller for ContractPoller {
    fn poll(&self, task_id: &str, snapshot: &Snapshot) -> PollResult {
        let Some(contract) = self.contracts.get(task_id) else {
            // Unknown task ids fail open.
            return PollResult::proceed(format!("no contract for {task_id}; failing open"));
        };

        // Scope paths held by someone else block dispatch outright.
        for path in &contract.scope_paths {
            if let Some(owner) = snapshot.claims.get(path)
                && owner != task_id
            {
                return PollResult::conflict(
                    format!("scope path {path} is claimed by {owner}"),
                    owner.clone(),
                );
            }
        }

        if contract.consumes.is_empty() {
            return PollResult::proceed("no consumed interfaces");
        }

        // Key -> distinct producers. Multiple producers for one consumed key
        // is an interface dispute, not a missing dependency.
        let mut index: HashMap<String, Vec<&str>> = HashMap::new();
        for e in &snapshot.entanglements {
            let key = match self.mode {
                MatchMode::Exact => format!("{}:{}:{}", e.kind, e.package, e.name),
                MatchMode::NameOnly => format!("{}:{}", e.kind, e.name),
            };
            let producers = index.entry(key).or_default();
            if !producers.contains(&e.producer_task_id.as_str()) {
                producers.push(&e.producer_task_id);
            }
        }

        let mut missing = Vec::new();
        for entry in &contract.consumes {
            let key = match self.mode {
                MatchMode::Exact => entry.exact_key(),
                MatchMode::NameOnly => entry.name_key(),
            };
            match index.get(&key) {
                None => missing.push(entry.to_string()),
                Some(producers) if producers.len() > 1 => {
                    let mut names: Vec<&str> = producers.clone();
                    names.sort();
                    return PollResult::conflict(
                        format!(
                            "{entry} has competing producers: {}",
                            names.join(", ")
                        ),
                        names[0],
                    );
                }
                Some(_) => {}
            }
        }

        if missing.is_empty() {
            PollResult::proceed("all consumed interfaces are published")
        } else {
            PollResult::need_info(
                format!("{} consumed interface(s) not yet published", missing.len()),
                missing,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// LLM poller
// ---------------------------------------------------------------------------

/// Minimal completion capability; the real model invocation lives outside
/// the core.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Scan gate that asks a language model to judge readiness from the task
/// body and the rendered snapshot. Empty, unparseable, and transport-failed
/// replies all fail open to PROCEED.
pub struct LlmPoller<C: LlmClient> {
    client: C,
    bodies: HashMap<String, String>,
}

impl<C: LlmClient> LlmPoller<C> {
    pub fn new(client: C, bodies: HashMap<String, String>) -> Self {
        Self { client, bodies }
    }

    fn prompt_for(&self, task_id: &str, snapshot: &Snapshot) -> String {
        let body = self
            .bodies
            .get(task_id)
            .map(String::as_str)
            .unwrap_or("(no task body)");
        format!(
            "You are the dispatch gate of a multi-agent build.\n\
             Decide whether task {task_id} can start now.\n\n\
             Task body:\n{body}\n\n\
             {}\n\
             Reply with PROCEED, NEED_INFO, or CONFLICT as the first word.\n\
             For NEED_INFO, list each missing item as a `-` bullet.\n\
             For CONFLICT, name the conflicting task in backticks.",
            snapshot.render(),
        )
    }
}

impl<C: LlmClient> Poller for LlmPoller<C> {
    fn poll(&self, task_id: &str, snapshot: &Snapshot) -> PollResult {
        let prompt = self.prompt_for(task_id, snapshot);
        match self.client.complete(&prompt) {
            Ok(reply) => parse_reply(&reply),
            Err(err) => PollResult::proceed(format!(
                "llm unavailable ({}); failing open",
                err.code()
            )),
        }
    }
}

/// Parse an LLM scan reply. The first whitespace-delimited token picks the
/// decision (case-insensitive, surrounding punctuation ignored); everything
/// unrecognizable falls open to PROCEED.
pub fn parse_reply(reply: &str) -> PollResult {
    let Some(first) = reply.split_whitespace().next() else {
        return PollResult::proceed("empty reply; failing open");
    };
    let token = first
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .to_ascii_uppercase();
    let first_line = reply.lines().next().unwrap_or("").trim().to_string();

    match token.as_str() {
        "PROCEED" => PollResult::proceed(first_line),
        "NEED_INFO" => {
            let missing: Vec<String> = reply
                .lines()
                .filter_map(|line| {
                    let trimmed = line.trim();
                    trimmed
                        .strip_prefix('-')
                        .or_else(|| trimmed.strip_prefix('*'))
                        .map(|rest| rest.trim().to_string())
                })
                .filter(|item| !item.is_empty())
                .collect();
            PollResult::need_info(first_line, missing)
        }
        "CONFLICT" => match extract_counterparty(reply) {
            Some(with) => PollResult::conflict(first_line, with),
            None => PollResult {
                decision: Decision::Conflict,
                reason: first_line,
                missing: vec![],
                conflict_with: None,
            },
        },
        _ => PollResult::proceed(format!("unrecognized reply '{first}'; failing open")),
    }
}

/// Pull the conflicting counterparty out of a CONFLICT reply: a backticked
/// identifier wins; otherwise the first token after "with"/"on"/"by".
fn extract_counterparty(reply: &str) -> Option<String> {
    if let Some(start) = reply.find('`') {
        let rest = &reply[start + 1..];
        if let Some(end) = rest.find('`') {
            let ident = rest[..end].trim();
            if !ident.is_empty() {
                return Some(ident.to_string());
            }
        }
    }

    let mut tokens = reply.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        let lowered = token.to_ascii_lowercase();
        if matches!(lowered.as_str(), "with" | "on" | "by")
            && let Some(next) = tokens.peek()
        {
            let ident = next.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_');
            if !ident.is_empty() {
                return Some(ident.to_string());
            }
        }
    }
    None
}
