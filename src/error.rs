use thiserror::Error;

/// Why a dump line was skipped. Skips are counted, never fatal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    #[error("expected {expected} tab-separated columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload is not valid JSON")]
    InvalidJson,

    #[error("record has no {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let err = LineError::ColumnCount {
            expected: 5,
            found: 2,
        };
        assert_eq!(err.to_string(), "expected 5 tab-separated columns, found 2");
        assert_eq!(
            LineError::MissingField("identifier").to_string(),
            "record has no identifier"
        );
    }
}
