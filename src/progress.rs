//! Step completion state machine.
//!
//! A user step's status is a pure function of three values: how many tasks the
//! step has, how many of the user's tasks for it are done, and whether the step
//! also needs an application form. Storage access lives in `app`; everything
//! here is plain arithmetic so it can be checked without a database.
//!
//! `Waiting` is never derived. It is only written by the application-form flow
//! through `App::submit_application`.

use crate::model::UserStepStatus;

/// Recency window for the activity report, in days.
pub const RECENT_ACTIVITY_DAYS: i64 = 30;

/// Counts that drive the derivation for a single user step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StepCounts {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub has_app: bool,
}

impl StepCounts {
    pub fn derive(&self) -> UserStepStatus {
        derive_step_status(self.total_tasks, self.completed_tasks, self.has_app)
    }

    pub fn all_tasks_completed(&self) -> bool {
        all_tasks_completed(self.total_tasks, self.completed_tasks)
    }

    /// Short explanation used when reporting an automatic status change.
    pub fn describe(&self) -> String {
        let done = self.completed_tasks;
        let total = self.total_tasks;
        match self.derive() {
            UserStepStatus::Done => format!("all tasks are done ({done}/{total})"),
            UserStepStatus::NotStarted => format!("no tasks done ({done}/{total})"),
            UserStepStatus::Started if self.all_tasks_completed() && self.has_app => {
                format!("all tasks are done ({done}/{total}) but the application is pending")
            }
            UserStepStatus::Started | UserStepStatus::Waiting => {
                format!("tasks done {done}/{total}")
            }
        }
    }
}

/// Rules are checked in order and the first match wins:
/// 1. every task done and no application required: `Done`
/// 2. nothing done: `NotStarted`
/// 3. anything else: `Started`
///
/// A step without tasks satisfies rule 1 vacuously. A completed count larger
/// than the total (dangling rows upstream) is tolerated and falls through.
pub fn derive_step_status(
    total_tasks: u64,
    completed_tasks: u64,
    has_app: bool,
) -> UserStepStatus {
    if all_tasks_completed(total_tasks, completed_tasks) && !has_app {
        UserStepStatus::Done
    } else if completed_tasks == 0 {
        UserStepStatus::NotStarted
    } else {
        UserStepStatus::Started
    }
}

pub fn all_tasks_completed(total_tasks: u64, completed_tasks: u64) -> bool {
    completed_tasks == total_tasks
}
