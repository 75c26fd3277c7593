use std::fmt;
use std::sync::PoisonError;
use thiserror::Error;

pub type TrenchResult<T, E = TrenchError> = Result<T, E>;

/// Errors that can escape the crate's public API.
///
/// Transfer functions never return a `TrenchError`: resolution misses are
/// logged and degrade to an empty `CalleeModel`, and budget exhaustion is
/// recorded in [`crate::statistics::Statistics`] rather than raised. The
/// only places this type is actually constructed are configuration loading
/// (before the fixpoint starts) and the opt-in callgraph JSON dump.
#[derive(Debug, Error)]
pub enum TrenchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON document error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("poisoned lock: {0}")]
    Poison(String),

    #[error("{0}")]
    Msg(String),
}

impl<T> From<PoisonError<T>> for TrenchError
where
    T: fmt::Debug,
{
    fn from(err: PoisonError<T>) -> Self {
        TrenchError::Poison(err.to_string())
    }
}

impl From<&str> for TrenchError {
    fn from(s: &str) -> Self {
        TrenchError::Msg(s.to_owned())
    }
}

impl From<String> for TrenchError {
    fn from(s: String) -> Self {
        TrenchError::Msg(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_retains_message() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "missing model file");
        let n: TrenchError = e.into();
        assert!(matches!(n, TrenchError::Io(_)));
        assert!(n.to_string().contains("missing model file"));
    }

    #[test]
    fn simple_string_into_msg() {
        let e: TrenchError = "bad rule document".into();
        assert!(matches!(e, TrenchError::Msg(s) if s == "bad rule document"));
    }
}
