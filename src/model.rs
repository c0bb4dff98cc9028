use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task. Only the scheduler writes these, except for
/// external resolution of a `HumanDecision`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Queued,
    Scanning,
    Running,
    Blocked,
    Done,
    Failed,
    HumanDecision,
}

impl TaskState {
    /// Terminal states never transition again under scheduler control.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States that make a task ineligible for a fresh scan.
    pub fn in_flight(self) -> bool {
        !matches!(self, Self::Queued)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "scanning" => Some(Self::Scanning),
            "running" => Some(Self::Running),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "human_decision" => Some(Self::HumanDecision),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Scanning => write!(f, "scanning"),
            Self::Running => write!(f, "running"),
            Self::Blocked => write!(f, "blocked"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::HumanDecision => write!(f, "human_decision"),
        }
    }
}

/// Kind of a published interface artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum EntanglementKind {
    Type,
    Function,
    Interface,
    Method,
    Package,
    File,
}

impl std::fmt::Display for EntanglementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Type => write!(f, "type"),
            Self::Function => write!(f, "function"),
            Self::Interface => write!(f, "interface"),
            Self::Method => write!(f, "method"),
            Self::Package => write!(f, "package"),
            Self::File => write!(f, "file"),
        }
    }
}

impl EntanglementKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "type" => Some(Self::Type),
            "function" => Some(Self::Function),
            "interface" => Some(Self::Interface),
            "method" => Some(Self::Method),
            "package" => Some(Self::Package),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum EntanglementStatus {
    #[default]
    Pending,
    Fulfilled,
    Disputed,
}

impl std::fmt::Display for EntanglementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fulfilled => write!(f, "fulfilled"),
            Self::Disputed => write!(f, "disputed"),
        }
    }
}

impl EntanglementStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fulfilled" => Some(Self::Fulfilled),
            "disputed" => Some(Self::Disputed),
            _ => None,
        }
    }
}

/// A published interface artifact. Uniquely keyed by
/// (producer_task_id, kind, name); `id` and `created_at` are assigned by the
/// fabric on first publish and survive upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entanglement {
    #[serde(default)]
    pub id: i64,
    pub producer_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_task_id: Option<String>,
    pub kind: EntanglementKind,
    pub name: String,
    pub signature: String,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub status: EntanglementStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Entanglement {
    pub fn new(
        producer: impl Into<String>,
        kind: EntanglementKind,
        name: impl Into<String>,
        signature: impl Into<String>,
        package: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            producer_task_id: producer.into(),
            consumer_task_id: None,
            kind,
            name: name.into(),
            signature: signature.into(),
            package: package.into(),
            file_path: None,
            status: EntanglementStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer_task_id = Some(consumer.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_status(mut self, status: EntanglementStatus) -> Self {
        self.status = status;
        self
    }
}

/// An exclusive file ownership record. `filepath` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub filepath: String,
    pub owner_task_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Category of an agent-surfaced issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum DiscoveryKind {
    EntanglementDispute,
    MissingDependency,
    FileConflict,
    RequirementsAmbiguity,
    BudgetAlert,
}

impl std::fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntanglementDispute => write!(f, "entanglement_dispute"),
            Self::MissingDependency => write!(f, "missing_dependency"),
            Self::FileConflict => write!(f, "file_conflict"),
            Self::RequirementsAmbiguity => write!(f, "requirements_ambiguity"),
            Self::BudgetAlert => write!(f, "budget_alert"),
        }
    }
}

impl DiscoveryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entanglement_dispute" => Some(Self::EntanglementDispute),
            "missing_dependency" => Some(Self::MissingDependency),
            "file_conflict" => Some(Self::FileConflict),
            "requirements_ambiguity" => Some(Self::RequirementsAmbiguity),
            "budget_alert" => Some(Self::BudgetAlert),
            _ => None,
        }
    }
}

/// An agent-surfaced issue. `affected_task_id = None` means broadcast.
/// Resolution is monotonic: once resolved, a discovery stays resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    #[serde(default)]
    pub id: i64,
    pub source_task_id: String,
    pub kind: DiscoveryKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_task_id: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Discovery {
    pub fn new(
        source: impl Into<String>,
        kind: DiscoveryKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            source_task_id: source.into(),
            kind,
            detail: detail.into(),
            affected_task_id: None,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_affected(mut self, task_id: impl Into<String>) -> Self {
        self.affected_task_id = Some(task_id.into());
        self
    }
}

/// Well-known kinds of working-memory entries. The store accepts free-form
/// kinds; these four get canonical placement when a snapshot is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum MemoryKind {
    Note,
    Decision,
    Failure,
    ReviewerFeedback,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Note => write!(f, "note"),
            Self::Decision => write!(f, "decision"),
            Self::Failure => write!(f, "failure"),
            Self::ReviewerFeedback => write!(f, "reviewer_feedback"),
        }
    }
}

/// A task-scoped, append-only working-memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub task_id: String,
    pub kind: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(task_id: impl Into<String>, kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: kind.to_string(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// One entry of a task contract: an interface the task produces or consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub kind: EntanglementKind,
    pub package: String,
    pub name: String,
}

impl ContractEntry {
    pub fn new(kind: EntanglementKind, package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            package: package.into(),
            name: name.into(),
        }
    }

    /// Full key: `kind:package:name`.
    pub fn exact_key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.package, self.name)
    }

    /// Package-agnostic key: `kind:name`.
    pub fn name_key(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

impl std::fmt::Display for ContractEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.package.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {} (package {})", self.kind, self.name, self.package)
        }
    }
}

/// Statically derived contract for a task: what it publishes, what it needs
/// published before it can start, and which paths it intends to touch.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<ContractEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<ContractEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_paths: Vec<String>,
}

/// External task descriptor consumed by the scheduler. The source format
/// (YAML, JSON, whatever drives the epoch) is parsed by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_paths: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Contract>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            priority,
            depends_on: vec![],
            scope_paths: vec![],
            body: String::new(),
            contract: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Trim and deduplicate list fields for deterministic handling.
    pub fn normalize(&mut self) {
        self.id = self.id.trim().to_string();
        for dep in &mut self.depends_on {
            let trimmed = dep.trim();
            if trimmed.len() != dep.len() {
                *dep = trimmed.to_string();
            }
        }
        self.depends_on.retain(|d| !d.is_empty());
        self.depends_on.sort();
        self.depends_on.dedup();
        self.scope_paths.retain(|p| !p.trim().is_empty());
        self.scope_paths.sort();
        self.scope_paths.dedup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips() {
        for state in [
            TaskState::Queued,
            TaskState::Scanning,
            TaskState::Running,
            TaskState::Blocked,
            TaskState::Done,
            TaskState::Failed,
            TaskState::HumanDecision,
        ] {
            assert_eq!(TaskState::parse(&state.to_string()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn task_state_serializes_snake_case() {
        let json = serde_json::to_string(&TaskState::HumanDecision).unwrap();
        assert_eq!(json, r#""human_decision""#);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Blocked.is_terminal());
        assert!(!TaskState::HumanDecision.is_terminal());
    }

    #[test]
    fn entanglement_defaults_pending() {
        let e = Entanglement::new("t1", EntanglementKind::Interface, "Store", "trait Store", "db");
        assert_eq!(e.status, EntanglementStatus::Pending);
        assert!(e.consumer_task_id.is_none());
        assert!(e.file_path.is_none());
    }

    #[test]
    fn entanglement_builder_chain() {
        let e = Entanglement::new("t1", EntanglementKind::File, "src/a.rs", "", "")
            .with_file_path("src/a.rs")
            .with_status(EntanglementStatus::Fulfilled)
            .with_consumer("t2");
        assert_eq!(e.file_path.as_deref(), Some("src/a.rs"));
        assert_eq!(e.status, EntanglementStatus::Fulfilled);
        assert_eq!(e.consumer_task_id.as_deref(), Some("t2"));
    }

    #[test]
    fn contract_entry_keys() {
        let entry = ContractEntry::new(EntanglementKind::Interface, "db", "Store");
        assert_eq!(entry.exact_key(), "interface:db:Store");
        assert_eq!(entry.name_key(), "interface:Store");
    }

    #[test]
    fn contract_entry_display_mentions_package() {
        let entry = ContractEntry::new(EntanglementKind::Function, "auth", "Login");
        assert_eq!(entry.to_string(), "function Login (package auth)");
        let bare = ContractEntry::new(EntanglementKind::Function, "", "Login");
        assert_eq!(bare.to_string(), "function Login");
    }

    #[test]
    fn task_spec_normalize_dedupes() {
        let mut spec = TaskSpec::new("  t1  ", 5);
        spec.depends_on = vec!["b".into(), " a ".into(), "b".into(), "".into()];
        spec.scope_paths = vec!["src/b.rs".into(), "src/a.rs".into(), "src/b.rs".into()];
        spec.normalize();
        assert_eq!(spec.id, "t1");
        assert_eq!(spec.depends_on, vec!["a", "b"]);
        assert_eq!(spec.scope_paths, vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn task_spec_round_trips_json() {
        let mut spec = TaskSpec::new("t1", 3);
        spec.body = "implement the store".into();
        spec.contract = Some(Contract {
            produces: vec![ContractEntry::new(EntanglementKind::Interface, "db", "Store")],
            consumes: vec![],
            scope_paths: vec!["src/store.rs".into()],
        });
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: TaskSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }

    #[test]
    fn minimal_task_spec_omits_empty_fields() {
        let spec = TaskSpec::new("t1", 0);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(!json.contains("depends_on"));
        assert!(!json.contains("scope_paths"));
        assert!(!json.contains("contract"));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn memory_entry_kind_is_textual() {
        let entry = MemoryEntry::new("t1", MemoryKind::ReviewerFeedback, "tighten errors");
        assert_eq!(entry.kind, "reviewer_feedback");
    }
}
