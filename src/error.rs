use thiserror::Error;

/// Main error type for the marketplace engine
#[derive(Error, Debug)]
pub enum HaggleError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors
    #[error("Invalid amount: {0} cents")]
    InvalidAmount(i64),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Proposal errors
    #[error("Buyer {buyer_id} already has a pending proposal on listing {listing_id}")]
    DuplicateProposal { listing_id: i64, buyer_id: i64 },

    // Listing availability race lost, or listing not purchasable
    #[error("Listing {listing_id} is no longer available")]
    ListingUnavailable { listing_id: i64 },

    // Order creation errors
    #[error("User {user_id} has no active address")]
    AddressRequired { user_id: i64 },

    #[error("Shipping estimate unavailable: {0}")]
    ShippingUnavailable(String),

    #[error("Payment intent creation failed: {0}")]
    PaymentIntentFailed(String),

    // Access errors
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    // External collaborator failures (generally retryable)
    #[error("Upstream {service} error: {reason}")]
    Upstream { service: &'static str, reason: String },

    // Computed totals don't reconcile; must never be swallowed
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl HaggleError {
    /// Whether the caller may retry the operation (bounded, per policy).
    ///
    /// Upstream/network failures are transient; everything else either
    /// reflects a final answer (validation, state conflicts) or an internal
    /// fault that retrying will not fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HaggleError::Http(_)
                | HaggleError::Upstream { .. }
                | HaggleError::PaymentIntentFailed(_)
                | HaggleError::ShippingUnavailable(_)
        )
    }
}

/// Result type alias for HaggleError
pub type Result<T> = std::result::Result<T, HaggleError>;
