pub mod journey;
pub mod login_session;
pub mod magic_link;
pub mod step;
pub mod task;
pub mod user;
pub mod user_journey;
pub mod user_step;
pub mod user_task;
