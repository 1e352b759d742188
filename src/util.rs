use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::app::{JourneyDetail, StepDetail, UserJourneyDetail};
use crate::entities::{step, task, user_step};
use crate::model::UserStepStatus;

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

fn app_marker(step: &step::Model) -> &'static str {
    if step.has_app {
        ", application"
    } else {
        ""
    }
}

fn checkbox(done: bool) -> &'static str {
    if done {
        "x"
    } else {
        " "
    }
}

pub fn format_journey_detail(detail: &JourneyDetail) -> String {
    let journey = &detail.journey;
    let mut output = String::new();
    output.push_str(&format!("Journey ID: {}\n", journey.id));
    output.push_str(&format!("Title: {}\n", journey.title));
    output.push_str(&format!("Description: {}\n", journey.description));
    output.push_str(&format!("Created: {}\n", format_datetime(journey.created_at)));
    output.push_str(&format!("Updated: {}\n", format_datetime(journey.updated_at)));
    output.push('\n');
    output.push_str(&format_step_list(&detail.steps, &detail.tasks));
    output.trim_end().to_string()
}

fn format_step_list(steps: &[step::Model], tasks: &HashMap<i64, Vec<task::Model>>) -> String {
    if steps.is_empty() {
        return "Steps: (none)".to_string();
    }
    let mut output = String::from("Steps:\n");
    for step in steps {
        output.push_str(&format!(
            "{}. {} (step id {}{})\n",
            step.sort_order,
            step.title,
            step.id,
            app_marker(step)
        ));
        for task in tasks.get(&step.id).map(Vec::as_slice).unwrap_or_default() {
            output.push_str(&format!("   - {} (task id {})\n", task.title, task.id));
        }
    }
    output
}

pub fn format_step_detail(detail: &StepDetail) -> String {
    let step = &detail.step;
    let mut output = String::new();
    output.push_str(&format!("Step ID: {}\n", step.id));
    output.push_str(&format!("Journey ID: {}\n", step.journey_id));
    output.push_str(&format!("Title: {}\n", step.title));
    output.push_str(&format!(
        "Application: {}\n",
        if step.has_app { "required" } else { "none" }
    ));
    output.push_str(&format!("Order: {}\n", step.sort_order));
    output.push_str(&format!("Updated: {}\n", format_datetime(step.updated_at)));
    output.push('\n');
    if detail.tasks.is_empty() {
        output.push_str("Tasks: (none)");
        return output;
    }
    output.push_str("Tasks:\n");
    for task in &detail.tasks {
        output.push_str(&format!("- {} (task id {})\n", task.title, task.id));
    }
    output.trim_end().to_string()
}

pub fn format_user_journey_detail(detail: &UserJourneyDetail) -> String {
    let mut output = String::new();
    output.push_str(&format!("Progress ID: {}\n", detail.user_journey.id));
    output.push_str(&format!(
        "Journey: {} (journey id {})\n",
        detail.journey.title, detail.journey.id
    ));
    output.push_str(&format!(
        "Started: {}\n",
        format_datetime(detail.user_journey.created_at)
    ));
    let done = detail
        .steps
        .iter()
        .filter(|entry| entry.user_step.as_ref().is_some_and(|us| us.is_done()))
        .count();
    output.push_str(&format!("Steps done: {done}/{}\n", detail.steps.len()));
    output.push('\n');

    if detail.steps.is_empty() {
        output.push_str("Steps: (none)");
        return output;
    }
    output.push_str("Steps:\n");
    for entry in &detail.steps {
        let step = &entry.step;
        match &entry.user_step {
            Some(user_step) => output.push_str(&format!(
                "- [{}] {} (user step id {}{})\n",
                user_step.status,
                step.title,
                user_step.id,
                app_marker(step)
            )),
            None => output.push_str(&format!(
                "- [{}] {} (step id {}{})\n",
                UserStepStatus::NotStarted.as_str(),
                step.title,
                step.id,
                app_marker(step)
            )),
        }
        for task in &entry.tasks {
            output.push_str(&format!(
                "  - [{}] {} (task id {})\n",
                checkbox(task.is_done()),
                task.task.title,
                task.task.id
            ));
        }
    }
    output.trim_end().to_string()
}

pub fn format_user_step_line(user_step: &user_step::Model) -> String {
    format!(
        "user step id {} (progress id {}, step id {}): {} since {}",
        user_step.id,
        user_step.user_journey_id,
        user_step.step_id,
        user_step.status,
        format_datetime(user_step.updated_at)
    )
}
