use thiserror::Error;

/// Queue engine errors
#[derive(Error, Debug)]
pub enum QueueEngineError {
    /// A ticket or counter operation was attempted from an incompatible state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Call-next found no waiting ticket the counter can serve
    #[error("No eligible ticket: {0}")]
    NoEligibleTicket(String),

    /// A claim race was detected by the store's status check
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Check-in rejected because the branch queue is closed
    #[error("Queue closed: {0}")]
    QueueClosed(String),

    /// Check-in rejected because the branch queue is paused
    #[error("Queue paused: {0}")]
    QueuePaused(String),

    /// Check-in rejected because the branch queue is at capacity
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Unknown ticket, counter, branch, or service id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueEngineError {
    /// Create a new InvalidTransition error
    pub fn invalid_transition<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a new NoEligibleTicket error
    pub fn no_eligible_ticket<S: Into<String>>(msg: S) -> Self {
        Self::NoEligibleTicket(msg.into())
    }

    /// Create a new ConcurrentModification error
    pub fn concurrent_modification<S: Into<String>>(msg: S) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    /// Create a new QueueClosed error
    pub fn queue_closed<S: Into<String>>(msg: S) -> Self {
        Self::QueueClosed(msg.into())
    }

    /// Create a new QueuePaused error
    pub fn queue_paused<S: Into<String>>(msg: S) -> Self {
        Self::QueuePaused(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for queue engine operations
pub type Result<T> = std::result::Result<T, QueueEngineError>;
