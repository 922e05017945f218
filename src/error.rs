use crate::types::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("exam not found: {0}")]
    ExamNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session is {state:?} and accepts no further writes")]
    SessionTerminated { state: SessionState },
    #[error("item {item_id} is not the pending item for this session")]
    ItemNotAdministered { item_id: String },
    #[error("response shape does not match the item answer key")]
    ResponseTypeMismatch,
    #[error("no eligible item remains in the pool")]
    PoolExhausted,
    #[error("objective {objective} requires {required} items but the pool covers {available}")]
    InsufficientPoolCoverage {
        objective: String,
        required: usize,
        available: usize,
    },
    #[error("pool of {available} items cannot satisfy {required} total questions")]
    InsufficientPoolSize { required: usize, available: usize },
}

impl EngineError {
    /// Protocol errors signal an out-of-order client call; the session is
    /// left unmodified when one is returned.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::SessionTerminated { .. }
                | Self::ItemNotAdministered { .. }
                | Self::ResponseTypeMismatch
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ExamNotFound(_) | Self::SessionNotFound(_))
    }
}
