use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Every failure the routing layer can surface to a caller or a plugin host
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The registry has no (enabled) entry for the target service
    #[error("Service '{service_name}' is not registered")]
    UnknownService { service_name: String },

    /// Nothing is consuming the target queue
    #[error("No consumer bound to queue '{queue}'")]
    NoConsumer { queue: String },

    /// No reply arrived before the deadline
    #[error("RPC call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The remote handler ran and answered with an error reply
    #[error("{message}")]
    Handler {
        service: String,
        action: String,
        message: String,
    },

    /// AMQP connection or channel errors
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Non-AMQP transport failures (closed in-memory broker, dropped channel)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid queue name: {reason}")]
    InvalidQueueName { reason: String },

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Envelope without a tenant identifier
    #[error("Message carries no subdomain")]
    MissingTenant,

    #[error("Failed to resolve state for tenant '{subdomain}': {reason}")]
    TenantResolution { subdomain: String, reason: String },

    /// An action of the plugin's action set has no handler
    #[error("Action '{action}' of service '{service}' has no handler bound")]
    UnboundAction { service: String, action: String },

    #[error("Action '{action}' is already bound")]
    DuplicateBinding { action: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BrokerError {
    pub fn transport_error<T: ToString>(message: T) -> Self {
        Self::Transport(message.to_string())
    }

    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    pub fn invalid_message<T: ToString>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    /// Connection-level failure beneath the routing layer
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Amqp(_) | Self::Transport(_))
    }

    /// Check if error is recoverable (the same call may succeed later)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Amqp(_) | Self::Transport(_) => true,
            Self::Timeout { .. } | Self::NoConsumer { .. } => true,
            _ => false,
        }
    }
}
