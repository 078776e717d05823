use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoeError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Expert {expert} returned shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        expert: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Expert {expert} failed: {message}")]
    Expert { expert: usize, message: String },

    #[error("Config loading error: {source}")]
    ConfigLoad {
        #[from]
        source: std::io::Error,
    },

    #[error("Config parsing error: {source}")]
    ConfigParse {
        #[from]
        source: serde_json::Error,
    },
}

impl MoeError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        MoeError::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn input(message: impl Into<String>) -> Self {
        MoeError::InvalidInput {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MoeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = MoeError::ShapeMismatch {
            expert: 3,
            expected: (4, 16),
            found: (4, 8),
        };
        assert_eq!(
            err.to_string(),
            "Expert 3 returned shape (4, 8), expected (4, 16)"
        );
    }

    #[test]
    fn test_io_error_converts_to_config_load() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MoeError = io.into();
        assert!(matches!(err, MoeError::ConfigLoad { .. }));
    }
}
