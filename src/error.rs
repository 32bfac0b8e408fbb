use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Everything a socket event can be rejected for. `AuthenticationRejected`
/// refuses the connection before the upgrade; the rest become a scoped
/// `error` event to the initiating connection only.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("{0}")]
    AuthorizationDenied(String),

    #[error("{0}")]
    ValidationFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Collaborator(#[from] StoreError),
}

impl WsError {
    /// Short, non-technical string for the client. Collaborator detail never
    /// leaves the server log.
    pub fn client_message(&self) -> String {
        match self {
            WsError::Collaborator(_) => "something went wrong, please try again".to_owned(),
            other => other.to_string(),
        }
    }
}
