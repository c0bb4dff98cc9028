use thiserror::Error;

#[derive(Debug, Error)]
pub enum TychoError {
    #[error("file '{path}' is already claimed by task {owner}")]
    AlreadyClaimed { path: String, owner: String },

    #[error("discovery {0} not found")]
    DiscoveryNotFound(i64),

    #[error("node '{0}' already exists in the graph")]
    DuplicateNode(String),

    #[error("node '{0}' not found in the graph")]
    NodeNotFound(String),

    #[error("self-edge: node '{0}' cannot depend on itself")]
    SelfEdge(String),

    #[error("dependency cycle: edge {0} -> {1} would close a loop")]
    Cycle(String, String),

    #[error("graph contains a cycle; topological order is undefined")]
    GraphCyclic,

    #[error("alpha {0} out of range; impact weighting requires 0.0..=1.0")]
    AlphaOutOfRange(f64),

    #[error("fabric locked by another scheduler: {0}")]
    Locked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl TychoError {
    /// Stable machine-readable code for each error kind. Callers that need
    /// to branch on a condition should match on the variant; the code is for
    /// serialized surfaces (telemetry, escalation reports).
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::DiscoveryNotFound(_) => "discovery_not_found",
            Self::DuplicateNode(_) => "duplicate_node",
            Self::NodeNotFound(_) => "node_not_found",
            Self::SelfEdge(_) => "self_edge",
            Self::Cycle(_, _) => "cycle",
            Self::GraphCyclic => "cycle",
            Self::AlphaOutOfRange(_) => "alpha_out_of_range",
            Self::Locked(_) => "locked",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Db(_) => "db_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TychoError>;
