//! Pipeline stage identifiers.

use serde::{Deserialize, Serialize};

/// One of the six fixed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Normalize,
    Sanitize,
    Rerank,
    Allocate,
    Compress,
    Assemble,
}

impl StageKind {
    /// The only order in which stages ever run.
    pub const SEQUENCE: [StageKind; 6] = [
        StageKind::Normalize,
        StageKind::Sanitize,
        StageKind::Rerank,
        StageKind::Allocate,
        StageKind::Compress,
        StageKind::Assemble,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Sanitize => "sanitize",
            Self::Rerank => "rerank",
            Self::Allocate => "allocate",
            Self::Compress => "compress",
            Self::Assemble => "assemble",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
