use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{}", Labeled("Not found", .0))]
    NotFound(String),
    #[error("{}", Labeled("Invalid input", .0))]
    InvalidInput(String),
    #[error("{}", Labeled("Unauthorized", .0))]
    Unauthorized(String),
}

struct Labeled<'a>(&'a str, &'a str);

impl fmt::Display for Labeled<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Labeled(label, message) = self;
        if message.contains('\n') {
            write!(f, "{label}:\n{message}")
        } else {
            write!(f, "{label}: {message}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_messages_stay_inline() {
        let err = AppError::NotFound("journey id 4".to_string());
        assert_eq!(err.to_string(), "Not found: journey id 4");
    }

    #[test]
    fn multi_line_messages_start_on_next_line() {
        let err = AppError::InvalidInput("first\nsecond".to_string());
        assert_eq!(err.to_string(), "Invalid input:\nfirst\nsecond");
    }
}
