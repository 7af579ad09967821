//! Error taxonomy of the router.
//!
//! Variants classify by behavior, not by structure: parse-stage failures
//! are never retried, shard failures distinguish clean read failures from
//! writes with partial effects, and index-maintenance failures never
//! surface to the writing client.

use thiserror::Error;

use tessera_topology::TopologyError;

use crate::sql::{ParseFailure, ParserError, TokenizerError};

/// One shard's failure inside a fan-out.
#[derive(Debug, Clone)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub node_id: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error(transparent)]
    Tokenize(#[from] TokenizerError),

    #[error(transparent)]
    Parse(#[from] ParserError),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("plan error: {0}")]
    Plan(String),

    /// One or more shards failed during a fan-out. `partial_write` marks
    /// write statements whose effects may have landed on other shards.
    #[error("shard execution failed (partial_write={partial_write}): {}",
        .failures.first().map(|f| f.message.as_str()).unwrap_or("unknown"))]
    ShardExecution {
        failures: Vec<ShardFailure>,
        partial_write: bool,
    },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("index maintenance error: {0}")]
    IndexMaintenance(String),

    #[error("unsupported statement: {0}")]
    Unsupported(String),
}

impl From<ParseFailure> for ConductorError {
    fn from(failure: ParseFailure) -> Self {
        match failure {
            ParseFailure::Tokenize(err) => ConductorError::Tokenize(err),
            ParseFailure::Parse(err) => ConductorError::Parse(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
