use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStepStatus {
    NotStarted,
    Started,
    Waiting,
    Done,
}

impl UserStepStatus {
    pub const ALL: [UserStepStatus; 4] = [
        UserStepStatus::NotStarted,
        UserStepStatus::Started,
        UserStepStatus::Waiting,
        UserStepStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Started => "started",
            Self::Waiting => "waiting",
            Self::Done => "done",
        }
    }

    /// Parses a persisted status. Unknown values are an error, never a default.
    pub fn parse(value: &str) -> Result<Self, AppError> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown user step status '{value}'")))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTaskStatus {
    NotStarted,
    Done,
}

impl UserTaskStatus {
    pub const ALL: [UserTaskStatus; 2] = [UserTaskStatus::NotStarted, UserTaskStatus::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Done => "done",
        }
    }
}

/// Result reported by the application-form flow once its last page is submitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationOutcome {
    Waiting,
    Done,
}

impl ApplicationOutcome {
    pub fn status(&self) -> UserStepStatus {
        match self {
            Self::Waiting => UserStepStatus::Waiting,
            Self::Done => UserStepStatus::Done,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google_oauth2",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JourneyInput {
    pub title: String,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepInput {
    pub title: String,
    pub has_app: bool,
    pub tasks: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JourneyChanges {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepChanges {
    pub title: Option<String>,
    pub has_app: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskChanges {
    pub title: Option<String>,
}
