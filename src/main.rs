mod app;
mod auth;
mod cli;
mod config;
mod db;
mod entities;
mod error;
mod model;
mod progress;
mod util;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{App, StatusChanges};
use crate::auth::LoginOutcome;
use crate::cli::{
    ApplicationOutcomeArg, AuthCommand, Cli, Command, JourneyAdd, JourneyAddTree, JourneyCommand,
    JourneyUpdate, OAuthProviderArg, ProgressCommand, ProgressSubmitApp, ReportCommand,
    ReportRecent, StepAdd, StepCommand, StepRemove, StepSpec, StepUpdate, TaskAdd, TaskCommand,
    TaskRemove, TaskUpdate,
};
use crate::config::Settings;
use crate::entities::user_step;
use crate::error::AppError;
use crate::model::{
    ApplicationOutcome, JourneyChanges, JourneyInput, OAuthProvider, StepChanges, StepInput,
    TaskChanges, UserStepStatus,
};
use crate::util::{
    format_datetime, format_journey_detail, format_step_detail, format_user_journey_detail,
    format_user_step_line,
};

const DEFAULT_LOG_FILTER: &str = "warn";

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(config::LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run() -> Result<(), AppError> {
    let Cli {
        data_dir,
        session_id,
        magic_link_ttl_minutes,
        command,
    } = Cli::parse();
    let settings = Settings::resolve(data_dir, session_id, magic_link_ttl_minutes)?;

    let db_path = db::resolve_db_path(&settings.data_dir);
    db::ensure_parent_dir(&db_path)?;
    let mut lock = db::open_lock(&db_path)?;
    let _guard = lock.write()?;

    let db = db::connect(&db_path).await?;
    db::ensure_schema(&db).await?;
    let app = App::new(db, settings.session_id).with_magic_link_ttl(settings.magic_link_ttl);

    match command {
        Command::Journey(command) => handle_journey(&app, command).await,
        Command::Step(command) => handle_step(&app, command).await,
        Command::Task(command) => handle_task(&app, command).await,
        Command::Auth(command) => handle_auth(&app, command).await,
        Command::Progress(command) => handle_progress(&app, command).await,
        Command::Report(command) => handle_report(&app, command).await,
    }
}

async fn handle_journey(app: &App, command: JourneyCommand) -> Result<(), AppError> {
    match command {
        JourneyCommand::Add(args) => handle_journey_add(app, args).await,
        JourneyCommand::AddTree(args) => handle_journey_add_tree(app, args).await,
        JourneyCommand::List => {
            let journeys = app.list_journeys().await?;
            if journeys.is_empty() {
                println!("No journeys.");
                return Ok(());
            }
            for journey in journeys {
                println!("- {} (journey id {})", journey.title, journey.id);
            }
            Ok(())
        }
        JourneyCommand::Show(args) => {
            let detail = app.get_journey_detail(args.id).await?;
            println!("{}", format_journey_detail(&detail));
            Ok(())
        }
        JourneyCommand::Update(args) => handle_journey_update(app, args).await,
        JourneyCommand::Remove(args) => {
            app.delete_journey(args.id).await?;
            println!("Journey ID: {} removed.", args.id);
            Ok(())
        }
    }
}

async fn handle_journey_add(app: &App, args: JourneyAdd) -> Result<(), AppError> {
    let journey = app
        .add_journey(JourneyInput {
            title: args.title,
            description: args.description,
        })
        .await?;
    println!("Created journey ID: {}: {}", journey.id, journey.title);
    Ok(())
}

async fn handle_journey_add_tree(app: &App, args: JourneyAddTree) -> Result<(), AppError> {
    let specs = parse_journey_add_tree_steps(&args.args)?;
    let steps = specs
        .into_iter()
        .map(|spec| StepInput {
            title: spec.title,
            has_app: spec.has_app,
            tasks: spec.tasks,
        })
        .collect();

    let (journey, step_count, task_count) = app
        .add_journey_tree(
            JourneyInput {
                title: args.title,
                description: args.description,
            },
            steps,
        )
        .await?;

    println!(
        "Created journey ID: {}: {} (steps: {}, tasks: {})",
        journey.id, journey.title, step_count, task_count
    );
    Ok(())
}

async fn handle_journey_update(app: &App, args: JourneyUpdate) -> Result<(), AppError> {
    if args.title.is_none() && args.description.is_none() {
        return Err(AppError::InvalidInput(
            "journey update requires --title or --description".to_string(),
        ));
    }
    let journey = app
        .update_journey(
            args.id,
            JourneyChanges {
                title: args.title,
                description: args.description,
            },
        )
        .await?;
    println!("Updated journey ID: {}: {}", journey.id, journey.title);
    Ok(())
}

async fn handle_step(app: &App, command: StepCommand) -> Result<(), AppError> {
    match command {
        StepCommand::Add(args) => handle_step_add(app, args).await,
        StepCommand::Show(args) => {
            let detail = app.get_step_detail(args.id).await?;
            println!("{}", format_step_detail(&detail));
            Ok(())
        }
        StepCommand::Update(args) => handle_step_update(app, args).await,
        StepCommand::Remove(args) => handle_step_remove(app, args).await,
    }
}

async fn handle_step_add(app: &App, args: StepAdd) -> Result<(), AppError> {
    let (step, tasks) = app
        .add_step(args.journey_id, args.title, args.app, args.tasks)
        .await?;
    println!(
        "Created step ID: {} for journey ID: {} (tasks: {})",
        step.id,
        step.journey_id,
        tasks.len()
    );
    Ok(())
}

async fn handle_step_update(app: &App, args: StepUpdate) -> Result<(), AppError> {
    if args.title.is_none() && args.app.is_none() {
        return Err(AppError::InvalidInput(
            "step update requires --title or --app".to_string(),
        ));
    }
    let step = app
        .update_step(
            args.id,
            StepChanges {
                title: args.title,
                has_app: args.app,
            },
        )
        .await?;
    println!("Updated step ID: {}: {}", step.id, step.title);
    Ok(())
}

async fn handle_step_remove(app: &App, args: StepRemove) -> Result<(), AppError> {
    if args.ids.is_empty() {
        return Err(AppError::InvalidInput("no step ids provided".to_string()));
    }
    let deleted = app.delete_steps(&args.ids).await?;
    if args.ids.len() == 1 {
        println!("Step ID: {} removed.", args.ids[0]);
    } else {
        println!("Removed {} steps.", deleted);
    }
    Ok(())
}

async fn handle_task(app: &App, command: TaskCommand) -> Result<(), AppError> {
    match command {
        TaskCommand::Add(args) => handle_task_add(app, args).await,
        TaskCommand::Update(args) => handle_task_update(app, args).await,
        TaskCommand::Remove(args) => handle_task_remove(app, args).await,
    }
}

async fn handle_task_add(app: &App, args: TaskAdd) -> Result<(), AppError> {
    let tasks = app.add_tasks(args.step_id, args.titles).await?;
    for task in tasks {
        println!("Created task ID: {} for step ID: {}: {}", task.id, task.step_id, task.title);
    }
    Ok(())
}

async fn handle_task_update(app: &App, args: TaskUpdate) -> Result<(), AppError> {
    if args.title.is_none() {
        return Err(AppError::InvalidInput(
            "task update requires --title".to_string(),
        ));
    }
    let task = app
        .update_task(args.id, TaskChanges { title: args.title })
        .await?;
    println!("Updated task ID: {}: {}", task.id, task.title);
    Ok(())
}

async fn handle_task_remove(app: &App, args: TaskRemove) -> Result<(), AppError> {
    if args.ids.is_empty() {
        return Err(AppError::InvalidInput("no task ids provided".to_string()));
    }
    let deleted = app.delete_tasks(&args.ids).await?;
    if args.ids.len() == 1 {
        println!("Task ID: {} removed.", args.ids[0]);
    } else {
        println!("Removed {} tasks.", deleted);
    }
    Ok(())
}

async fn handle_auth(app: &App, command: AuthCommand) -> Result<(), AppError> {
    match command {
        AuthCommand::ReturnTo(args) => {
            let path = app.remember_return_to(&args.path).await?;
            println!("Return path saved: {path}");
        }
        AuthCommand::MagicLink(args) => {
            let link = app.request_magic_link(&args.email).await?;
            println!(
                "Magic link for {} (expires {}):",
                link.email,
                format_datetime(link.expires_at)
            );
            println!("{}", link.callback_path());
        }
        AuthCommand::Callback(args) => {
            let outcome = app.consume_magic_link(&args.token).await?;
            print_login(&outcome);
        }
        AuthCommand::OAuth(args) => {
            let provider = match args.provider {
                OAuthProviderArg::Google => OAuthProvider::Google,
            };
            let outcome = app.login_with_oauth(provider, &args.email).await?;
            print_login(&outcome);
        }
        AuthCommand::Whoami => match app.current_user().await? {
            Some(user) => println!("Logged in as {} (user ID: {}).", user.email, user.id),
            None => println!("Not logged in."),
        },
        AuthCommand::Logout => {
            if app.logout().await? {
                println!("Logged out.");
            } else {
                println!("Not logged in.");
            }
        }
    }
    Ok(())
}

fn print_login(outcome: &LoginOutcome) {
    let note = if outcome.created { ", new account" } else { "" };
    println!(
        "Logged in as {} (user ID: {}{}).",
        outcome.user.email, outcome.user.id, note
    );
    println!("Redirect: {}", outcome.redirect_to);
}

async fn handle_progress(app: &App, command: ProgressCommand) -> Result<(), AppError> {
    match command {
        ProgressCommand::Start(args) => {
            let (detail, changes, created) = app.start_journey(args.journey_id).await?;
            if created {
                println!(
                    "Started journey ID: {} (progress ID: {}).",
                    detail.journey.id, detail.user_journey.id
                );
            } else {
                println!(
                    "Journey ID: {} already started (progress ID: {}).",
                    detail.journey.id, detail.user_journey.id
                );
            }
            print_status_changes(&changes);
        }
        ProgressCommand::List => {
            let entries = app.list_user_journeys().await?;
            if entries.is_empty() {
                println!("No journeys started.");
            }
            for (user_journey, journey) in entries {
                println!(
                    "- {} (progress id {}, journey id {}, started {})",
                    journey.title,
                    user_journey.id,
                    journey.id,
                    format_datetime(user_journey.created_at)
                );
            }
        }
        ProgressCommand::Show(args) => {
            let detail = app.user_journey_detail(args.id).await?;
            println!("{}", format_user_journey_detail(&detail));
        }
        ProgressCommand::Complete(args) => {
            let (user_task, changes) = app.complete_task(args.id, args.task_id).await?;
            println!(
                "Task ID: {} done (user step ID: {}).",
                user_task.task_id, user_task.user_step_id
            );
            print_status_changes(&changes);
        }
        ProgressCommand::Refresh(args) => {
            let (user_step, changes) = app.refresh_status(args.user_step_id).await?;
            println!("User step ID: {} status: {}.", user_step.id, user_step.status);
            print_status_changes(&changes);
        }
        ProgressCommand::Check(args) => {
            let id = args.user_step_id;
            println!("User step ID: {id}");
            println!("Done: {}", app.is_done(id).await?);
            println!("Waiting: {}", app.is_waiting(id).await?);
            println!("All tasks completed: {}", app.all_tasks_completed(id).await?);
        }
        ProgressCommand::SubmitApp(args) => handle_progress_submit_app(app, args).await?,
        ProgressCommand::Abandon(args) => {
            app.abandon_user_journey(args.id).await?;
            println!("Progress ID: {} removed.", args.id);
        }
    }
    Ok(())
}

async fn handle_progress_submit_app(app: &App, args: ProgressSubmitApp) -> Result<(), AppError> {
    let outcome = match args.outcome {
        ApplicationOutcomeArg::Waiting => ApplicationOutcome::Waiting,
        ApplicationOutcomeArg::Done => ApplicationOutcome::Done,
    };
    let (user_step, changes) = app
        .submit_application(args.user_step_id, outcome, args.task)
        .await?;
    println!(
        "User step ID: {} application recorded: {}.",
        user_step.id, user_step.status
    );
    print_status_changes(&changes);
    Ok(())
}

#[derive(Serialize)]
struct UserStepReport {
    user_step_id: i64,
    progress_id: i64,
    step_id: i64,
    status: UserStepStatus,
    updated_at: DateTime<Utc>,
}

impl UserStepReport {
    fn from_model(model: &user_step::Model) -> Result<Self, AppError> {
        Ok(Self {
            user_step_id: model.id,
            progress_id: model.user_journey_id,
            step_id: model.step_id,
            status: model.status()?,
            updated_at: model.updated_at,
        })
    }
}

async fn handle_report(app: &App, command: ReportCommand) -> Result<(), AppError> {
    let (steps, json) = match command {
        ReportCommand::Completed(args) => (app.completed_user_steps().await?, args.json),
        ReportCommand::Recent(ReportRecent { now, json }) => {
            let now = now.unwrap_or_else(Utc::now);
            (app.recently_active_user_steps(now).await?, json)
        }
    };

    if json {
        let report = steps
            .iter()
            .map(UserStepReport::from_model)
            .collect::<Result<Vec<_>, _>>()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if steps.is_empty() {
        println!("No user steps.");
        return Ok(());
    }
    for step in &steps {
        println!("- {}", format_user_step_line(step));
    }
    Ok(())
}

fn parse_journey_add_tree_steps(args: &[String]) -> Result<Vec<StepSpec>, AppError> {
    let mut steps = Vec::new();
    let mut current: Option<StepSpec> = None;
    let mut idx = 0;

    while idx < args.len() {
        match args[idx].as_str() {
            "--" => {
                idx += 1;
            }
            "--step" => {
                let value = args.get(idx + 1).ok_or_else(|| {
                    AppError::InvalidInput("journey add-tree --step requires a value".to_string())
                })?;
                if let Some(step) = current.take() {
                    steps.push(step);
                }
                current = Some(StepSpec {
                    title: value.to_string(),
                    has_app: false,
                    tasks: Vec::new(),
                });
                idx += 2;
            }
            "--app" => {
                match current.as_mut() {
                    Some(step) => step.has_app = true,
                    None => {
                        return Err(AppError::InvalidInput(
                            "journey add-tree --app must follow a --step".to_string(),
                        ));
                    }
                }
                idx += 1;
            }
            "--task" => {
                let value = args.get(idx + 1).ok_or_else(|| {
                    AppError::InvalidInput("journey add-tree --task requires a value".to_string())
                })?;
                match current.as_mut() {
                    Some(step) => step.tasks.push(value.to_string()),
                    None => {
                        return Err(AppError::InvalidInput(
                            "journey add-tree --task must follow a --step".to_string(),
                        ));
                    }
                }
                idx += 2;
            }
            unexpected => {
                return Err(AppError::InvalidInput(format!(
                    "journey add-tree unexpected argument: {unexpected}"
                )));
            }
        }
    }

    if let Some(step) = current.take() {
        steps.push(step);
    }

    if steps.is_empty() {
        return Err(AppError::InvalidInput(
            "journey add-tree requires at least one --step".to_string(),
        ));
    }

    Ok(steps)
}

fn print_status_changes(changes: &StatusChanges) {
    if changes.is_empty() {
        return;
    }

    println!("Auto status updates:");
    for change in &changes.user_steps {
        println!(
            "- User step ID: {} status auto-updated from {} to {} ({}).",
            change.user_step_id, change.from, change.to, change.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn add_tree_groups_tasks_under_their_step() {
        let steps = parse_journey_add_tree_steps(&args(&[
            "--step", "Register", "--task", "Fill form", "--task", "Sign", "--step", "Apply",
            "--app",
        ]))
        .expect("parse");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].title, "Register");
        assert!(!steps[0].has_app);
        assert_eq!(steps[0].tasks, vec!["Fill form", "Sign"]);
        assert!(steps[1].has_app);
        assert!(steps[1].tasks.is_empty());
    }

    #[test]
    fn add_tree_rejects_task_before_step() {
        let err = parse_journey_add_tree_steps(&args(&["--task", "Orphan"])).unwrap_err();
        assert!(err.to_string().contains("--task must follow a --step"));
    }

    #[test]
    fn add_tree_requires_a_step() {
        let err = parse_journey_add_tree_steps(&args(&["--"])).unwrap_err();
        assert!(err.to_string().contains("at least one --step"));
    }
}
