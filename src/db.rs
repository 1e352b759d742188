use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{
    ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, EntityTrait, Schema, Statement,
};
use url::Url;

use crate::entities::{
    journey, login_session, magic_link, step, task, user, user_journey, user_step, user_task,
};
use crate::error::AppError;
use crate::model::{UserStepStatus, UserTaskStatus};

pub fn resolve_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("journeys.db")
}

pub fn ensure_parent_dir(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn open_lock(path: &Path) -> Result<fd_lock::RwLock<File>, AppError> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)?;
    Ok(fd_lock::RwLock::new(file))
}

pub async fn connect(path: &Path) -> Result<DatabaseConnection, AppError> {
    let mut url = Url::from_file_path(path)
        .map_err(|_| AppError::InvalidInput(format!("invalid sqlite path: {}", path.display())))?;
    url.set_query(Some("mode=rwc"));
    let sqlite_url = url.as_str().replacen("file://", "sqlite://", 1);
    tracing::debug!(url = %sqlite_url, "connecting to database");
    Ok(Database::connect(&sqlite_url).await?)
}

pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), AppError> {
    db.execute(Statement::from_string(
        DatabaseBackend::Sqlite,
        "PRAGMA foreign_keys = ON;",
    ))
    .await?;

    // Parents before children so foreign keys resolve.
    create_table(db, user::Entity).await?;
    create_table(db, journey::Entity).await?;
    create_table(db, step::Entity).await?;
    create_table(db, task::Entity).await?;
    create_table(db, user_journey::Entity).await?;
    create_table(db, user_step::Entity).await?;
    create_table(db, user_task::Entity).await?;
    create_table(db, login_session::Entity).await?;
    create_table(db, magic_link::Entity).await?;

    create_index(
        db,
        Index::create()
            .name("idx_users_email")
            .table(user::Entity)
            .col(user::Column::Email)
            .unique()
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_steps_journey_order")
            .table(step::Entity)
            .col(step::Column::JourneyId)
            .col(step::Column::SortOrder)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_tasks_step")
            .table(task::Entity)
            .col(task::Column::StepId)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_user_journeys_user_journey")
            .table(user_journey::Entity)
            .col(user_journey::Column::UserId)
            .col(user_journey::Column::JourneyId)
            .unique()
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_user_steps_user_journey")
            .table(user_step::Entity)
            .col(user_step::Column::UserJourneyId)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_user_tasks_user_step")
            .table(user_task::Entity)
            .col(user_task::Column::UserStepId)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_login_sessions_session")
            .table(login_session::Entity)
            .col(login_session::Column::SessionId)
            .unique()
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_magic_links_token")
            .table(magic_link::Entity)
            .col(magic_link::Column::TokenHash)
            .unique()
            .to_owned(),
    )
    .await?;

    let step_statuses: Vec<&str> = UserStepStatus::ALL.iter().map(|s| s.as_str()).collect();
    create_status_guards(db, "user_steps", "user step", &step_statuses).await?;
    let task_statuses: Vec<&str> = UserTaskStatus::ALL.iter().map(|s| s.as_str()).collect();
    create_status_guards(db, "user_tasks", "user task", &task_statuses).await?;

    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), AppError> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}

async fn create_index(
    db: &DatabaseConnection,
    mut stmt: IndexCreateStatement,
) -> Result<(), AppError> {
    let builder = db.get_database_backend();
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}

/// Rejects out-of-set status values at the storage layer, for inserts and
/// updates alike, so nothing can be coerced to a default later.
async fn create_status_guards(
    db: &DatabaseConnection,
    table: &str,
    label: &str,
    allowed: &[&str],
) -> Result<(), AppError> {
    let allowed = allowed
        .iter()
        .map(|value| format!("'{value}'"))
        .collect::<Vec<_>>()
        .join(", ");
    for (suffix, event) in [("insert", "INSERT"), ("update", "UPDATE OF status")] {
        let sql = format!(
            "CREATE TRIGGER IF NOT EXISTS trg_{table}_status_{suffix} \
             BEFORE {event} ON {table} \
             WHEN NEW.status NOT IN ({allowed}) \
             BEGIN SELECT RAISE(ABORT, 'invalid {label} status'); END;"
        );
        db.execute(Statement::from_string(DatabaseBackend::Sqlite, sql))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let db_path = resolve_db_path(dir.path());
        let db = connect(&db_path).await.expect("connect");
        ensure_schema(&db).await.expect("first run");
        ensure_schema(&db).await.expect("second run");
    }

    #[tokio::test]
    async fn status_guard_rejects_unknown_values() {
        let dir = TempDir::new().expect("temp dir");
        let db_path = resolve_db_path(dir.path());
        let db = connect(&db_path).await.expect("connect");
        ensure_schema(&db).await.expect("schema");

        let statements = [
            "INSERT INTO users (email, created_at, updated_at) VALUES ('a@b.sk', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            "INSERT INTO journeys (title, description, created_at, updated_at) VALUES ('J', 'D', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            "INSERT INTO steps (journey_id, title, has_app, sort_order, created_at, updated_at) VALUES (1, 'S', 0, 1, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            "INSERT INTO user_journeys (user_id, journey_id, created_at, updated_at) VALUES (1, 1, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            "INSERT INTO user_steps (user_journey_id, step_id, status, created_at, updated_at) VALUES (1, 1, 'started', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        ];
        for sql in statements {
            db.execute(Statement::from_string(DatabaseBackend::Sqlite, sql))
                .await
                .expect("seed");
        }

        let insert = db
            .execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                "INSERT INTO user_steps (user_journey_id, step_id, status, created_at, updated_at) VALUES (1, 1, 'finished', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            ))
            .await
            .unwrap_err();
        assert!(insert.to_string().contains("invalid user step status"));

        let update = db
            .execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                "UPDATE user_steps SET status = 'DONE' WHERE id = 1",
            ))
            .await
            .unwrap_err();
        assert!(update.to_string().contains("invalid user step status"));

        db.execute(Statement::from_string(
            DatabaseBackend::Sqlite,
            "UPDATE user_steps SET status = 'waiting' WHERE id = 1",
        ))
        .await
        .expect("valid status accepted");
    }
}
