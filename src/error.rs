use thiserror::Error;

/// Failure of a single template expression.
///
/// Stored inside the placeholder at parse time and only raised when the
/// statement that contains it is compiled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("name '{0}' is not defined")]
    UnresolvedName(String),

    #[error("invalid expression syntax: {0}")]
    Syntax(String),

    #[error("unsupported operand types: {0}")]
    TypeMismatch(String),

    #[error("index {0} out of range")]
    IndexOutOfRange(i64),

    #[error("no field named '{0}'")]
    MissingField(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("a SQL fragment cannot be bound as a parameter value")]
    FragmentAsValue,
}

#[derive(Debug, Error)]
pub enum SqlBlockError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("No active query block: {0}")]
    ScopeResolution(String),

    #[error("Cannot evaluate placeholder {{{expression}}}: {source}")]
    PlaceholderEvaluation {
        expression: String,
        #[source]
        source: EvalError,
    },

    #[error("Protocol misuse: {0}")]
    ProtocolMisuse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),
}

impl SqlBlockError {
    /// True for failures raised by the backend while running a statement.
    #[must_use]
    pub fn is_backend_error(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            SqlBlockError::PostgresError(_) => true,
            SqlBlockError::ExecutionError(_) => true,
            _ => false,
        }
    }
}
