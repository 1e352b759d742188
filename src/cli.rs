use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{DATA_DIR_ENV, MAGIC_LINK_TTL_ENV, SESSION_ENV};

#[derive(Parser, Debug)]
#[command(
    name = "journeys",
    version,
    about = "Track progress through step-by-step journeys with SQLite"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = DATA_DIR_ENV,
        value_name = "PATH",
        help = "Directory holding journeys.db (default: $HOME/.journeys)"
    )]
    pub data_dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        env = SESSION_ENV,
        value_name = "ID",
        help = "Session identifier"
    )]
    pub session_id: Option<String>,
    #[arg(
        long,
        global = true,
        env = MAGIC_LINK_TTL_ENV,
        value_name = "MINUTES",
        help = "Magic link lifetime in minutes (at most 10080)"
    )]
    pub magic_link_ttl_minutes: Option<i64>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(subcommand)]
    Journey(JourneyCommand),
    #[command(subcommand)]
    Step(StepCommand),
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Auth(AuthCommand),
    #[command(subcommand)]
    Progress(ProgressCommand),
    #[command(subcommand)]
    Report(ReportCommand),
}

#[derive(Subcommand, Debug)]
pub enum JourneyCommand {
    Add(JourneyAdd),
    #[command(name = "add-tree")]
    AddTree(JourneyAddTree),
    List,
    Show(JourneyShow),
    Update(JourneyUpdate),
    Remove(JourneyRemove),
}

#[derive(Subcommand, Debug)]
pub enum StepCommand {
    Add(StepAdd),
    Show(StepShow),
    Update(StepUpdate),
    Remove(StepRemove),
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Add(TaskAdd),
    Update(TaskUpdate),
    Remove(TaskRemove),
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    #[command(name = "return-to")]
    ReturnTo(AuthReturnTo),
    #[command(name = "magic-link")]
    MagicLink(AuthMagicLink),
    Callback(AuthCallback),
    #[command(name = "oauth")]
    OAuth(AuthOAuth),
    Whoami,
    Logout,
}

#[derive(Subcommand, Debug)]
pub enum ProgressCommand {
    Start(ProgressStart),
    List,
    Show(ProgressShow),
    Complete(ProgressComplete),
    Refresh(ProgressRefresh),
    Check(ProgressCheck),
    #[command(name = "submit-app")]
    SubmitApp(ProgressSubmitApp),
    Abandon(ProgressAbandon),
}

#[derive(Subcommand, Debug)]
pub enum ReportCommand {
    Completed(ReportCompleted),
    Recent(ReportRecent),
}

#[derive(Args, Debug)]
pub struct JourneyAdd {
    pub title: String,
    pub description: String,
}

#[derive(Args, Debug)]
pub struct JourneyAddTree {
    pub title: String,
    pub description: String,
    #[arg(
        value_name = "ARGS",
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Use --step <title> [--app] [--task <title> ...] repeating per step"
    )]
    pub args: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct StepSpec {
    pub title: String,
    pub has_app: bool,
    pub tasks: Vec<String>,
}

#[derive(Args, Debug)]
pub struct JourneyShow {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct JourneyUpdate {
    pub id: i64,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args, Debug)]
pub struct JourneyRemove {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct StepAdd {
    pub journey_id: i64,
    pub title: String,
    #[arg(long, help = "The step also requires an application form")]
    pub app: bool,
    #[arg(long = "task", value_name = "TITLE")]
    pub tasks: Vec<String>,
}

#[derive(Args, Debug)]
pub struct StepShow {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct StepUpdate {
    pub id: i64,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long, value_name = "BOOL")]
    pub app: Option<bool>,
}

#[derive(Args, Debug)]
pub struct StepRemove {
    #[arg(value_name = "ID", num_args = 1..)]
    pub ids: Vec<i64>,
}

#[derive(Args, Debug)]
pub struct TaskAdd {
    pub step_id: i64,
    #[arg(value_name = "TITLE", num_args = 1..)]
    pub titles: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TaskUpdate {
    pub id: i64,
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Args, Debug)]
pub struct TaskRemove {
    #[arg(value_name = "ID", num_args = 1..)]
    pub ids: Vec<i64>,
}

#[derive(Args, Debug)]
pub struct AuthReturnTo {
    pub path: String,
}

#[derive(Args, Debug)]
pub struct AuthMagicLink {
    pub email: String,
}

#[derive(Args, Debug)]
pub struct AuthCallback {
    pub token: String,
}

#[derive(Args, Debug)]
pub struct AuthOAuth {
    pub email: String,
    #[arg(long, value_enum, default_value = "google")]
    pub provider: OAuthProviderArg,
}

#[derive(Args, Debug)]
pub struct ProgressStart {
    pub journey_id: i64,
}

#[derive(Args, Debug)]
pub struct ProgressShow {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ProgressComplete {
    pub id: i64,
    pub task_id: i64,
}

#[derive(Args, Debug)]
pub struct ProgressRefresh {
    pub user_step_id: i64,
}

#[derive(Args, Debug)]
pub struct ProgressCheck {
    pub user_step_id: i64,
}

#[derive(Args, Debug)]
pub struct ProgressSubmitApp {
    pub user_step_id: i64,
    #[arg(long, value_enum)]
    pub outcome: ApplicationOutcomeArg,
    #[arg(long, value_name = "ID")]
    pub task: Option<i64>,
}

#[derive(Args, Debug)]
pub struct ProgressAbandon {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ReportCompleted {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ReportRecent {
    #[arg(long, value_name = "RFC3339", help = "Reference time (default: now)")]
    pub now: Option<DateTime<Utc>>,
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum OAuthProviderArg {
    Google,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum ApplicationOutcomeArg {
    Waiting,
    Done,
}
