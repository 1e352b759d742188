use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    QueryTrait, Set, TransactionTrait,
};
use serde::Serialize;

use crate::entities::{journey, step, task, user_journey, user_step, user_task};
use crate::error::AppError;
use crate::model::{
    ApplicationOutcome, JourneyChanges, JourneyInput, StepChanges, StepInput, TaskChanges,
    UserStepStatus, UserTaskStatus,
};
use crate::progress::{StepCounts, RECENT_ACTIVITY_DAYS};

pub struct App {
    pub(crate) db: DatabaseConnection,
    pub(crate) session_id: String,
    pub(crate) magic_link_ttl: Duration,
}

#[derive(Debug)]
pub struct JourneyDetail {
    pub journey: journey::Model,
    pub steps: Vec<step::Model>,
    pub tasks: HashMap<i64, Vec<task::Model>>,
}

#[derive(Debug)]
pub struct StepDetail {
    pub step: step::Model,
    pub tasks: Vec<task::Model>,
}

#[derive(Debug)]
pub struct TaskProgress {
    pub task: task::Model,
    pub user_task: Option<user_task::Model>,
}

impl TaskProgress {
    pub fn is_done(&self) -> bool {
        self.user_task.as_ref().is_some_and(|ut| ut.is_done())
    }
}

#[derive(Debug)]
pub struct UserStepDetail {
    pub step: step::Model,
    pub user_step: Option<user_step::Model>,
    pub tasks: Vec<TaskProgress>,
}

#[derive(Debug)]
pub struct UserJourneyDetail {
    pub user_journey: user_journey::Model,
    pub journey: journey::Model,
    pub steps: Vec<UserStepDetail>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UserStepStatusChange {
    pub user_step_id: i64,
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Default, Debug)]
pub struct StatusChanges {
    pub user_steps: Vec<UserStepStatusChange>,
}

impl StatusChanges {
    pub fn merge(&mut self, other: StatusChanges) {
        self.user_steps.extend(other.user_steps);
    }

    pub fn is_empty(&self) -> bool {
        self.user_steps.is_empty()
    }
}

impl App {
    pub fn new(db: DatabaseConnection, session_id: String) -> Self {
        Self {
            db,
            session_id,
            magic_link_ttl: Duration::minutes(crate::config::DEFAULT_MAGIC_LINK_TTL_MINUTES),
        }
    }

    pub fn with_magic_link_ttl(mut self, ttl: Duration) -> Self {
        self.magic_link_ttl = ttl;
        self
    }

    pub async fn add_journey(&self, input: JourneyInput) -> Result<journey::Model, AppError> {
        let (journey, _, _) = self.add_journey_tree(input, Vec::new()).await?;
        Ok(journey)
    }

    pub async fn add_journey_tree(
        &self,
        input: JourneyInput,
        steps: Vec<StepInput>,
    ) -> Result<(journey::Model, usize, usize), AppError> {
        ensure_non_empty("journey title", &input.title)?;
        ensure_non_empty("journey description", &input.description)?;
        for step in &steps {
            ensure_non_empty("step title", &step.title)?;
            for task in &step.tasks {
                ensure_non_empty("task title", task)?;
            }
        }

        let txn = self.db.begin().await?;
        let result: Result<(journey::Model, usize, usize), AppError> = async {
            let now = Utc::now();
            let active = journey::ActiveModel {
                title: Set(input.title),
                description: Set(input.description),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            let insert = journey::Entity::insert(active).exec(&txn).await?;
            let journey_model = journey::Entity::find_by_id(insert.last_insert_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound("journey not found after insert".to_string()))?;

            let mut step_count = 0usize;
            let mut task_count = 0usize;
            for (idx, step_input) in steps.into_iter().enumerate() {
                let step_model = insert_step(
                    &txn,
                    journey_model.id,
                    step_input.title,
                    step_input.has_app,
                    (idx + 1) as i32,
                )
                .await?;
                step_count += 1;
                task_count += insert_tasks(&txn, step_model.id, step_input.tasks, 1)
                    .await?
                    .len();
            }

            Ok((journey_model, step_count, task_count))
        }
        .await;

        let result = finalize_transaction(txn, result).await?;
        tracing::info!(
            journey_id = result.0.id,
            steps = result.1,
            tasks = result.2,
            "journey created"
        );
        Ok(result)
    }

    pub async fn list_journeys(&self) -> Result<Vec<journey::Model>, AppError> {
        Ok(journey::Entity::find()
            .order_by_asc(journey::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn get_journey(&self, id: i64) -> Result<journey::Model, AppError> {
        journey::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("journey id {id}")))
    }

    pub async fn get_step(&self, id: i64) -> Result<step::Model, AppError> {
        step::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("step id {id}")))
    }

    pub async fn get_journey_detail(&self, id: i64) -> Result<JourneyDetail, AppError> {
        let journey = self.get_journey(id).await?;
        let steps = steps_for_journey_with_conn(&self.db, id).await?;
        let step_ids: Vec<i64> = steps.iter().map(|step| step.id).collect();
        let tasks = tasks_for_steps_with_conn(&self.db, &step_ids).await?;
        Ok(JourneyDetail {
            journey,
            steps,
            tasks,
        })
    }

    pub async fn get_step_detail(&self, id: i64) -> Result<StepDetail, AppError> {
        let step = self.get_step(id).await?;
        let mut tasks = tasks_for_steps_with_conn(&self.db, &[id]).await?;
        Ok(StepDetail {
            step,
            tasks: tasks.remove(&id).unwrap_or_default(),
        })
    }

    pub async fn update_journey(
        &self,
        id: i64,
        changes: JourneyChanges,
    ) -> Result<journey::Model, AppError> {
        if let Some(title) = changes.title.as_deref() {
            ensure_non_empty("journey title", title)?;
        }
        if let Some(description) = changes.description.as_deref() {
            ensure_non_empty("journey description", description)?;
        }
        let mut active = journey::ActiveModel {
            id: Set(id),
            ..Default::default()
        };
        if let Some(title) = changes.title {
            active.title = Set(title);
        }
        if let Some(description) = changes.description {
            active.description = Set(description);
        }
        active.updated_at = Set(Utc::now());
        match active.update(&self.db).await {
            Ok(model) => Ok(model),
            Err(sea_orm::DbErr::RecordNotFound(_)) | Err(sea_orm::DbErr::RecordNotUpdated) => {
                Err(AppError::NotFound(format!("journey id {id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_journey(&self, id: i64) -> Result<(), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(), AppError> = async {
            journey::Entity::find_by_id(id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("journey id {id}")))?;

            let user_journey_ids: Vec<i64> = user_journey::Entity::find()
                .filter(user_journey::Column::JourneyId.eq(id))
                .all(&txn)
                .await?
                .into_iter()
                .map(|model| model.id)
                .collect();
            delete_user_journeys_with_conn(&txn, &user_journey_ids).await?;

            let step_ids: Vec<i64> = steps_for_journey_with_conn(&txn, id)
                .await?
                .into_iter()
                .map(|model| model.id)
                .collect();
            delete_steps_cascade_with_conn(&txn, &step_ids).await?;

            journey::Entity::delete_by_id(id).exec(&txn).await?;
            Ok(())
        }
        .await;

        finalize_transaction(txn, result).await?;
        tracing::info!(journey_id = id, "journey removed");
        Ok(())
    }

    pub async fn add_step(
        &self,
        journey_id: i64,
        title: String,
        has_app: bool,
        tasks: Vec<String>,
    ) -> Result<(step::Model, Vec<task::Model>), AppError> {
        ensure_non_empty("step title", &title)?;
        for task in &tasks {
            ensure_non_empty("task title", task)?;
        }

        let txn = self.db.begin().await?;
        let result: Result<(step::Model, Vec<task::Model>), AppError> = async {
            journey::Entity::find_by_id(journey_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("journey id {journey_id}")))?;

            let mut existing = steps_for_journey_with_conn(&txn, journey_id).await?;
            normalize_steps_in_place(&txn, &mut existing).await?;
            let sort_order = (existing.len() + 1) as i32;

            let step_model = insert_step(&txn, journey_id, title, has_app, sort_order).await?;
            let created = insert_tasks(&txn, step_model.id, tasks, 1).await?;
            touch_journey_with_conn(&txn, journey_id).await?;
            Ok((step_model, created))
        }
        .await;

        finalize_transaction(txn, result).await
    }

    /// Changing `has_app` does not recompute existing user steps; callers refresh them.
    pub async fn update_step(&self, id: i64, changes: StepChanges) -> Result<step::Model, AppError> {
        if let Some(title) = changes.title.as_deref() {
            ensure_non_empty("step title", title)?;
        }
        let mut active = step::ActiveModel {
            id: Set(id),
            ..Default::default()
        };
        if let Some(title) = changes.title {
            active.title = Set(title);
        }
        if let Some(has_app) = changes.has_app {
            active.has_app = Set(has_app);
        }
        active.updated_at = Set(Utc::now());
        match active.update(&self.db).await {
            Ok(model) => Ok(model),
            Err(sea_orm::DbErr::RecordNotFound(_)) | Err(sea_orm::DbErr::RecordNotUpdated) => {
                Err(AppError::NotFound(format!("step id {id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_steps(&self, ids: &[i64]) -> Result<u64, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<u64, AppError> = async {
            if ids.is_empty() {
                return Ok(0);
            }
            let requested = unique_ids(ids);
            let steps = step::Entity::find()
                .filter(step::Column::Id.is_in(requested.clone()))
                .all(&txn)
                .await?;
            let existing: HashSet<i64> = steps.iter().map(|step| step.id).collect();
            let missing: Vec<i64> = requested
                .iter()
                .cloned()
                .filter(|id| !existing.contains(id))
                .collect();
            if !missing.is_empty() {
                return Err(AppError::NotFound(format!(
                    "step id(s) not found: {}",
                    join_ids(&missing)
                )));
            }
            let mut seen = HashSet::new();
            let mut journey_ids = Vec::new();
            for step in &steps {
                if seen.insert(step.journey_id) {
                    journey_ids.push(step.journey_id);
                }
            }

            let deleted = delete_steps_cascade_with_conn(&txn, &requested).await?;
            for journey_id in &journey_ids {
                let mut remaining = steps_for_journey_with_conn(&txn, *journey_id).await?;
                normalize_steps_in_place(&txn, &mut remaining).await?;
                touch_journey_with_conn(&txn, *journey_id).await?;
            }
            Ok(deleted)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    /// Tasks added here are not mirrored into existing user journeys; they are
    /// picked up lazily when the user completes them.
    pub async fn add_tasks(
        &self,
        step_id: i64,
        titles: Vec<String>,
    ) -> Result<Vec<task::Model>, AppError> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }
        for title in &titles {
            ensure_non_empty("task title", title)?;
        }

        let txn = self.db.begin().await?;
        let result: Result<Vec<task::Model>, AppError> = async {
            let step_model = step::Entity::find_by_id(step_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("step id {step_id}")))?;
            let mut existing = tasks_for_steps_with_conn(&txn, &[step_id])
                .await?
                .remove(&step_id)
                .unwrap_or_default();
            normalize_tasks_in_place(&txn, &mut existing).await?;
            let created = insert_tasks(&txn, step_id, titles, existing.len() + 1).await?;
            touch_journey_with_conn(&txn, step_model.journey_id).await?;
            Ok(created)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn update_task(&self, id: i64, changes: TaskChanges) -> Result<task::Model, AppError> {
        if let Some(title) = changes.title.as_deref() {
            ensure_non_empty("task title", title)?;
        }
        let txn = self.db.begin().await?;
        let result: Result<task::Model, AppError> = async {
            task::Entity::find_by_id(id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("task id {id}")))?;
            ensure_tasks_unreferenced(&txn, &[id]).await?;

            let mut active = task::ActiveModel {
                id: Set(id),
                ..Default::default()
            };
            if let Some(title) = changes.title {
                active.title = Set(title);
            }
            active.updated_at = Set(Utc::now());
            Ok(active.update(&txn).await?)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn delete_tasks(&self, ids: &[i64]) -> Result<u64, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<u64, AppError> = async {
            if ids.is_empty() {
                return Ok(0);
            }
            let requested = unique_ids(ids);
            let tasks = task::Entity::find()
                .filter(task::Column::Id.is_in(requested.clone()))
                .all(&txn)
                .await?;
            let existing: HashSet<i64> = tasks.iter().map(|task| task.id).collect();
            let missing: Vec<i64> = requested
                .iter()
                .cloned()
                .filter(|id| !existing.contains(id))
                .collect();
            if !missing.is_empty() {
                return Err(AppError::NotFound(format!(
                    "task id(s) not found: {}",
                    join_ids(&missing)
                )));
            }
            ensure_tasks_unreferenced(&txn, &requested).await?;

            let step_ids = unique_ids(&tasks.iter().map(|task| task.step_id).collect::<Vec<_>>());
            let result = task::Entity::delete_many()
                .filter(task::Column::Id.is_in(requested))
                .exec(&txn)
                .await?;
            for step_id in &step_ids {
                let mut remaining = tasks_for_steps_with_conn(&txn, &[*step_id])
                    .await?
                    .remove(step_id)
                    .unwrap_or_default();
                normalize_tasks_in_place(&txn, &mut remaining).await?;
            }
            Ok(result.rows_affected)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    /// Creates the session user's progress records for a journey: one user step
    /// per step and one user task per task, then derives every step's status.
    /// Starting an already started journey returns the existing records.
    pub async fn start_journey(
        &self,
        journey_id: i64,
    ) -> Result<(UserJourneyDetail, StatusChanges, bool), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(i64, StatusChanges, bool), AppError> = async {
            let user = self.require_user_with_conn(&txn).await?;
            journey::Entity::find_by_id(journey_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("journey id {journey_id}")))?;

            if let Some(existing) = user_journey::Entity::find()
                .filter(user_journey::Column::UserId.eq(user.id))
                .filter(user_journey::Column::JourneyId.eq(journey_id))
                .one(&txn)
                .await?
            {
                return Ok((existing.id, StatusChanges::default(), false));
            }

            let now = Utc::now();
            let active = user_journey::ActiveModel {
                user_id: Set(user.id),
                journey_id: Set(journey_id),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            let insert = user_journey::Entity::insert(active).exec(&txn).await?;
            let user_journey_id = insert.last_insert_id;

            let steps = steps_for_journey_with_conn(&txn, journey_id).await?;
            let step_ids: Vec<i64> = steps.iter().map(|step| step.id).collect();
            let tasks = tasks_for_steps_with_conn(&txn, &step_ids).await?;

            let mut changes = StatusChanges::default();
            for step_model in &steps {
                let user_step = insert_user_step(&txn, user_journey_id, step_model.id).await?;
                if let Some(step_tasks) = tasks.get(&step_model.id) {
                    for task_model in step_tasks {
                        insert_user_task(&txn, user_step.id, task_model.id).await?;
                    }
                }
                let (_, refreshed) = refresh_status_with_conn(&txn, user_step.id).await?;
                changes.merge(refreshed);
            }

            Ok((user_journey_id, changes, true))
        }
        .await;

        let (user_journey_id, changes, created) = finalize_transaction(txn, result).await?;
        if created {
            tracing::info!(journey_id, user_journey_id, "journey started");
        }
        let detail = self.user_journey_detail(user_journey_id).await?;
        Ok((detail, changes, created))
    }

    pub async fn list_user_journeys(
        &self,
    ) -> Result<Vec<(user_journey::Model, journey::Model)>, AppError> {
        let user = self.require_user_with_conn(&self.db).await?;
        let rows = user_journey::Entity::find()
            .filter(user_journey::Column::UserId.eq(user.id))
            .find_also_related(journey::Entity)
            .order_by_asc(user_journey::Column::Id)
            .all(&self.db)
            .await?;
        let mut listed = Vec::with_capacity(rows.len());
        for (user_journey, journey) in rows {
            let journey = journey.ok_or_else(|| {
                AppError::NotFound(format!("journey id {}", user_journey.journey_id))
            })?;
            listed.push((user_journey, journey));
        }
        Ok(listed)
    }

    pub async fn user_journey_detail(&self, id: i64) -> Result<UserJourneyDetail, AppError> {
        let user_journey = self.owned_user_journey_with_conn(&self.db, id).await?;
        let journey = self.get_journey(user_journey.journey_id).await?;
        let steps = steps_for_journey_with_conn(&self.db, journey.id).await?;
        let step_ids: Vec<i64> = steps.iter().map(|step| step.id).collect();
        let mut tasks = tasks_for_steps_with_conn(&self.db, &step_ids).await?;

        let user_steps = user_step::Entity::find()
            .filter(user_step::Column::UserJourneyId.eq(id))
            .order_by_asc(user_step::Column::Id)
            .all(&self.db)
            .await?;
        let user_step_ids: Vec<i64> = user_steps.iter().map(|us| us.id).collect();
        let user_tasks = if user_step_ids.is_empty() {
            Vec::new()
        } else {
            user_task::Entity::find()
                .filter(user_task::Column::UserStepId.is_in(user_step_ids))
                .order_by_asc(user_task::Column::Id)
                .all(&self.db)
                .await?
        };

        let mut user_steps_by_step: HashMap<i64, user_step::Model> = HashMap::new();
        for user_step in user_steps {
            user_steps_by_step.entry(user_step.step_id).or_insert(user_step);
        }
        let mut user_tasks_by_task: HashMap<(i64, i64), user_task::Model> = HashMap::new();
        for user_task in user_tasks {
            user_tasks_by_task
                .entry((user_task.user_step_id, user_task.task_id))
                .or_insert(user_task);
        }

        let mut details = Vec::with_capacity(steps.len());
        for step_model in steps {
            let user_step = user_steps_by_step.remove(&step_model.id);
            let step_tasks = tasks.remove(&step_model.id).unwrap_or_default();
            let task_progress = step_tasks
                .into_iter()
                .map(|task_model| {
                    let user_task = user_step.as_ref().and_then(|us| {
                        user_tasks_by_task.remove(&(us.id, task_model.id))
                    });
                    TaskProgress {
                        task: task_model,
                        user_task,
                    }
                })
                .collect();
            details.push(UserStepDetail {
                step: step_model,
                user_step,
                tasks: task_progress,
            });
        }

        Ok(UserJourneyDetail {
            user_journey,
            journey,
            steps: details,
        })
    }

    /// Marks a task done for the session user and recomputes the owning step.
    /// Rows missing because the task or step was added after the journey was
    /// started are created on the way. Completion never regresses.
    pub async fn complete_task(
        &self,
        user_journey_id: i64,
        task_id: i64,
    ) -> Result<(user_task::Model, StatusChanges), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(user_task::Model, StatusChanges), AppError> = async {
            let user_journey = self
                .owned_user_journey_with_conn(&txn, user_journey_id)
                .await?;
            let task_model = task::Entity::find_by_id(task_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("task id {task_id}")))?;
            let step_model = step::Entity::find_by_id(task_model.step_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("step id {}", task_model.step_id)))?;
            if step_model.journey_id != user_journey.journey_id {
                return Err(AppError::InvalidInput(format!(
                    "task id {task_id} is not part of journey id {}",
                    user_journey.journey_id
                )));
            }

            let user_step =
                find_or_create_user_step(&txn, user_journey.id, step_model.id).await?;
            let user_task = mark_task_done_with_conn(&txn, user_step.id, task_id).await?;
            let (_, changes) = refresh_status_with_conn(&txn, user_step.id).await?;
            touch_user_journey_with_conn(&txn, user_journey.id).await?;
            Ok((user_task, changes))
        }
        .await;

        let result = finalize_transaction(txn, result).await?;
        tracing::info!(user_journey_id, task_id, "task completed");
        Ok(result)
    }

    /// Recomputes a user step from its task counts and persists the result.
    pub async fn refresh_status(
        &self,
        user_step_id: i64,
    ) -> Result<(user_step::Model, StatusChanges), AppError> {
        self.owned_user_step_with_conn(&self.db, user_step_id).await?;
        refresh_status_with_conn(&self.db, user_step_id).await
    }

    pub async fn is_done(&self, user_step_id: i64) -> Result<bool, AppError> {
        let user_step = self.owned_user_step_with_conn(&self.db, user_step_id).await?;
        Ok(user_step.is_done())
    }

    pub async fn is_waiting(&self, user_step_id: i64) -> Result<bool, AppError> {
        let user_step = self.owned_user_step_with_conn(&self.db, user_step_id).await?;
        Ok(user_step.is_waiting())
    }

    /// Live check, independent of the application flag and of the stored status.
    pub async fn all_tasks_completed(&self, user_step_id: i64) -> Result<bool, AppError> {
        let user_step = self.owned_user_step_with_conn(&self.db, user_step_id).await?;
        let counts = step_counts_with_conn(&self.db, &user_step).await?;
        Ok(counts.all_tasks_completed())
    }

    /// Records the result of the application form for a step that requires one.
    /// Optionally marks the form's task done, then writes the outcome status
    /// directly. This is the only path that produces `waiting`.
    pub async fn submit_application(
        &self,
        user_step_id: i64,
        outcome: ApplicationOutcome,
        task_id: Option<i64>,
    ) -> Result<(user_step::Model, StatusChanges), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(user_step::Model, StatusChanges), AppError> = async {
            let user_step = self.owned_user_step_with_conn(&txn, user_step_id).await?;
            let step_model = step::Entity::find_by_id(user_step.step_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("step id {}", user_step.step_id)))?;
            if !step_model.has_app {
                return Err(AppError::InvalidInput(format!(
                    "step id {} does not require an application",
                    step_model.id
                )));
            }

            if let Some(task_id) = task_id {
                let task_model = task::Entity::find_by_id(task_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("task id {task_id}")))?;
                if task_model.step_id != step_model.id {
                    return Err(AppError::InvalidInput(format!(
                        "task id {task_id} is not part of step id {}",
                        step_model.id
                    )));
                }
                mark_task_done_with_conn(&txn, user_step.id, task_id).await?;
            }

            let status = outcome.status();
            let reason = match outcome {
                ApplicationOutcome::Waiting => "application submitted, awaiting delivery",
                ApplicationOutcome::Done => "application completed",
            };
            let (model, changes) =
                write_status_with_conn(&txn, user_step, status, reason.to_string()).await?;
            touch_user_journey_with_conn(&txn, model.user_journey_id).await?;
            Ok((model, changes))
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn abandon_user_journey(&self, id: i64) -> Result<(), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(), AppError> = async {
            self.owned_user_journey_with_conn(&txn, id).await?;
            delete_user_journeys_with_conn(&txn, &[id]).await?;
            Ok(())
        }
        .await;

        finalize_transaction(txn, result).await?;
        tracing::info!(user_journey_id = id, "journey progress removed");
        Ok(())
    }

    pub async fn completed_user_steps(&self) -> Result<Vec<user_step::Model>, AppError> {
        Ok(user_step::Entity::find()
            .filter(user_step::Column::Status.eq(UserStepStatus::Done.as_str()))
            .order_by_asc(user_step::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// User steps in progress (neither done nor untouched) that changed, or
    /// whose tasks changed, within the last `RECENT_ACTIVITY_DAYS` days.
    pub async fn recently_active_user_steps(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<user_step::Model>, AppError> {
        let cutoff = now - Duration::days(RECENT_ACTIVITY_DAYS);
        let touched = user_task::Entity::find()
            .select_only()
            .column(user_task::Column::UserStepId)
            .filter(user_task::Column::UpdatedAt.gt(cutoff))
            .into_query();
        let activity = Condition::any()
            .add(user_step::Column::UpdatedAt.gt(cutoff))
            .add(user_step::Column::Id.in_subquery(touched));

        let steps = user_step::Entity::find()
            .filter(activity)
            .filter(user_step::Column::Status.is_not_in([
                UserStepStatus::Done.as_str(),
                UserStepStatus::NotStarted.as_str(),
            ]))
            .order_by_asc(user_step::Column::Id)
            .all(&self.db)
            .await?;
        tracing::debug!(count = steps.len(), %cutoff, "recently active user steps");
        Ok(steps)
    }

    async fn owned_user_journey_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        id: i64,
    ) -> Result<user_journey::Model, AppError> {
        let user = self.require_user_with_conn(db).await?;
        user_journey::Entity::find_by_id(id)
            .filter(user_journey::Column::UserId.eq(user.id))
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user journey id {id}")))
    }

    async fn owned_user_step_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        id: i64,
    ) -> Result<user_step::Model, AppError> {
        let user = self.require_user_with_conn(db).await?;
        let found = user_step::Entity::find_by_id(id)
            .find_also_related(user_journey::Entity)
            .one(db)
            .await?;
        match found {
            Some((user_step, Some(owner))) if owner.user_id == user.id => Ok(user_step),
            _ => Err(AppError::NotFound(format!("user step id {id}"))),
        }
    }
}

pub(crate) async fn refresh_status_with_conn<C: ConnectionTrait>(
    db: &C,
    user_step_id: i64,
) -> Result<(user_step::Model, StatusChanges), AppError> {
    let user_step = user_step::Entity::find_by_id(user_step_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user step id {user_step_id}")))?;
    let counts = step_counts_with_conn(db, &user_step).await?;
    let status = counts.derive();
    write_status_with_conn(db, user_step, status, counts.describe()).await
}

async fn step_counts_with_conn<C: ConnectionTrait>(
    db: &C,
    user_step: &user_step::Model,
) -> Result<StepCounts, AppError> {
    let step_model = step::Entity::find_by_id(user_step.step_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("step id {}", user_step.step_id)))?;
    let total_tasks = task::Entity::find()
        .filter(task::Column::StepId.eq(step_model.id))
        .count(db)
        .await?;
    let completed_tasks = user_task::Entity::find()
        .filter(user_task::Column::UserStepId.eq(user_step.id))
        .filter(user_task::Column::Status.eq(UserTaskStatus::Done.as_str()))
        .count(db)
        .await?;
    Ok(StepCounts {
        total_tasks,
        completed_tasks,
        has_app: step_model.has_app,
    })
}

/// Single-row update, skipped when the stored value already matches so that
/// repeated refreshes leave the row (and its `updated_at`) untouched.
async fn write_status_with_conn<C: ConnectionTrait>(
    db: &C,
    user_step: user_step::Model,
    status: UserStepStatus,
    reason: String,
) -> Result<(user_step::Model, StatusChanges), AppError> {
    let mut changes = StatusChanges::default();
    if user_step.status == status.as_str() {
        return Ok((user_step, changes));
    }

    let from = user_step.status.clone();
    let mut active: user_step::ActiveModel = user_step.into();
    active.status = Set(status.as_str().to_string());
    active.updated_at = Set(Utc::now());
    let updated = active.update(db).await?;
    tracing::info!(
        user_step_id = updated.id,
        from = %from,
        to = status.as_str(),
        reason = %reason,
        "user step status changed"
    );
    changes.user_steps.push(UserStepStatusChange {
        user_step_id: updated.id,
        from,
        to: status.as_str().to_string(),
        reason,
    });
    Ok((updated, changes))
}

async fn mark_task_done_with_conn<C: ConnectionTrait>(
    db: &C,
    user_step_id: i64,
    task_id: i64,
) -> Result<user_task::Model, AppError> {
    let existing = user_task::Entity::find()
        .filter(user_task::Column::UserStepId.eq(user_step_id))
        .filter(user_task::Column::TaskId.eq(task_id))
        .one(db)
        .await?;
    let user_task = match existing {
        Some(model) => model,
        None => insert_user_task(db, user_step_id, task_id).await?,
    };
    if user_task.is_done() {
        return Ok(user_task);
    }
    let mut active: user_task::ActiveModel = user_task.into();
    active.status = Set(UserTaskStatus::Done.as_str().to_string());
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

async fn find_or_create_user_step<C: ConnectionTrait>(
    db: &C,
    user_journey_id: i64,
    step_id: i64,
) -> Result<user_step::Model, AppError> {
    let existing = user_step::Entity::find()
        .filter(user_step::Column::UserJourneyId.eq(user_journey_id))
        .filter(user_step::Column::StepId.eq(step_id))
        .one(db)
        .await?;
    match existing {
        Some(model) => Ok(model),
        None => insert_user_step(db, user_journey_id, step_id).await,
    }
}

async fn insert_user_step<C: ConnectionTrait>(
    db: &C,
    user_journey_id: i64,
    step_id: i64,
) -> Result<user_step::Model, AppError> {
    let now = Utc::now();
    let active = user_step::ActiveModel {
        user_journey_id: Set(user_journey_id),
        step_id: Set(step_id),
        status: Set(UserStepStatus::NotStarted.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let insert = user_step::Entity::insert(active).exec(db).await?;
    user_step::Entity::find_by_id(insert.last_insert_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound("user step not found after insert".to_string()))
}

async fn insert_user_task<C: ConnectionTrait>(
    db: &C,
    user_step_id: i64,
    task_id: i64,
) -> Result<user_task::Model, AppError> {
    let now = Utc::now();
    let active = user_task::ActiveModel {
        user_step_id: Set(user_step_id),
        task_id: Set(task_id),
        status: Set(UserTaskStatus::NotStarted.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let insert = user_task::Entity::insert(active).exec(db).await?;
    user_task::Entity::find_by_id(insert.last_insert_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound("user task not found after insert".to_string()))
}

async fn insert_step<C: ConnectionTrait>(
    db: &C,
    journey_id: i64,
    title: String,
    has_app: bool,
    sort_order: i32,
) -> Result<step::Model, AppError> {
    let now = Utc::now();
    let active = step::ActiveModel {
        journey_id: Set(journey_id),
        title: Set(title),
        has_app: Set(has_app),
        sort_order: Set(sort_order),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let insert = step::Entity::insert(active).exec(db).await?;
    step::Entity::find_by_id(insert.last_insert_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound("step not found after insert".to_string()))
}

async fn insert_tasks<C: ConnectionTrait>(
    db: &C,
    step_id: i64,
    titles: Vec<String>,
    first_order: usize,
) -> Result<Vec<task::Model>, AppError> {
    let now = Utc::now();
    let mut created = Vec::with_capacity(titles.len());
    for (idx, title) in titles.into_iter().enumerate() {
        let active = task::ActiveModel {
            step_id: Set(step_id),
            title: Set(title),
            sort_order: Set((first_order + idx) as i32),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let insert = task::Entity::insert(active).exec(db).await?;
        let model = task::Entity::find_by_id(insert.last_insert_id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound("task not found after insert".to_string()))?;
        created.push(model);
    }
    Ok(created)
}

async fn steps_for_journey_with_conn<C: ConnectionTrait>(
    db: &C,
    journey_id: i64,
) -> Result<Vec<step::Model>, AppError> {
    Ok(step::Entity::find()
        .filter(step::Column::JourneyId.eq(journey_id))
        .order_by_asc(step::Column::SortOrder)
        .order_by_asc(step::Column::Id)
        .all(db)
        .await?)
}

async fn tasks_for_steps_with_conn<C: ConnectionTrait>(
    db: &C,
    step_ids: &[i64],
) -> Result<HashMap<i64, Vec<task::Model>>, AppError> {
    let mut grouped = HashMap::new();
    if step_ids.is_empty() {
        return Ok(grouped);
    }
    let tasks = task::Entity::find()
        .filter(task::Column::StepId.is_in(step_ids.to_vec()))
        .order_by_asc(task::Column::StepId)
        .order_by_asc(task::Column::SortOrder)
        .order_by_asc(task::Column::Id)
        .all(db)
        .await?;
    for task_model in tasks {
        grouped
            .entry(task_model.step_id)
            .or_insert_with(Vec::new)
            .push(task_model);
    }
    Ok(grouped)
}

async fn ensure_tasks_unreferenced<C: ConnectionTrait>(
    db: &C,
    task_ids: &[i64],
) -> Result<(), AppError> {
    let referenced: Vec<i64> = user_task::Entity::find()
        .select_only()
        .column(user_task::Column::TaskId)
        .filter(user_task::Column::TaskId.is_in(task_ids.to_vec()))
        .distinct()
        .into_tuple()
        .all(db)
        .await?;
    if referenced.is_empty() {
        return Ok(());
    }
    Err(AppError::InvalidInput(format!(
        "task id(s) already used in user progress: {}",
        join_ids(&referenced)
    )))
}

async fn delete_user_steps_with_conn<C: ConnectionTrait>(
    db: &C,
    user_step_ids: &[i64],
) -> Result<(), AppError> {
    if user_step_ids.is_empty() {
        return Ok(());
    }
    user_task::Entity::delete_many()
        .filter(user_task::Column::UserStepId.is_in(user_step_ids.to_vec()))
        .exec(db)
        .await?;
    user_step::Entity::delete_many()
        .filter(user_step::Column::Id.is_in(user_step_ids.to_vec()))
        .exec(db)
        .await?;
    Ok(())
}

async fn delete_user_journeys_with_conn<C: ConnectionTrait>(
    db: &C,
    user_journey_ids: &[i64],
) -> Result<(), AppError> {
    if user_journey_ids.is_empty() {
        return Ok(());
    }
    let user_step_ids: Vec<i64> = user_step::Entity::find()
        .filter(user_step::Column::UserJourneyId.is_in(user_journey_ids.to_vec()))
        .all(db)
        .await?
        .into_iter()
        .map(|model| model.id)
        .collect();
    delete_user_steps_with_conn(db, &user_step_ids).await?;
    user_journey::Entity::delete_many()
        .filter(user_journey::Column::Id.is_in(user_journey_ids.to_vec()))
        .exec(db)
        .await?;
    Ok(())
}

/// Removes steps together with their tasks and every user step recorded against them.
async fn delete_steps_cascade_with_conn<C: ConnectionTrait>(
    db: &C,
    step_ids: &[i64],
) -> Result<u64, AppError> {
    if step_ids.is_empty() {
        return Ok(0);
    }
    let user_step_ids: Vec<i64> = user_step::Entity::find()
        .filter(user_step::Column::StepId.is_in(step_ids.to_vec()))
        .all(db)
        .await?
        .into_iter()
        .map(|model| model.id)
        .collect();
    delete_user_steps_with_conn(db, &user_step_ids).await?;
    task::Entity::delete_many()
        .filter(task::Column::StepId.is_in(step_ids.to_vec()))
        .exec(db)
        .await?;
    let result = step::Entity::delete_many()
        .filter(step::Column::Id.is_in(step_ids.to_vec()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

async fn normalize_steps_in_place<C: ConnectionTrait>(
    db: &C,
    steps: &mut [step::Model],
) -> Result<(), AppError> {
    let now = Utc::now();
    for (idx, step_model) in steps.iter_mut().enumerate() {
        let desired_order = (idx + 1) as i32;
        if step_model.sort_order != desired_order {
            let mut active: step::ActiveModel = step_model.clone().into();
            active.sort_order = Set(desired_order);
            active.updated_at = Set(now);
            active.update(db).await?;
            step_model.sort_order = desired_order;
            step_model.updated_at = now;
        }
    }
    Ok(())
}

async fn normalize_tasks_in_place<C: ConnectionTrait>(
    db: &C,
    tasks: &mut [task::Model],
) -> Result<(), AppError> {
    let now = Utc::now();
    for (idx, task_model) in tasks.iter_mut().enumerate() {
        let desired_order = (idx + 1) as i32;
        if task_model.sort_order != desired_order {
            let mut active: task::ActiveModel = task_model.clone().into();
            active.sort_order = Set(desired_order);
            active.updated_at = Set(now);
            active.update(db).await?;
            task_model.sort_order = desired_order;
            task_model.updated_at = now;
        }
    }
    Ok(())
}

async fn touch_journey_with_conn<C: ConnectionTrait>(
    db: &C,
    journey_id: i64,
) -> Result<(), AppError> {
    let mut active = journey::ActiveModel {
        id: Set(journey_id),
        ..Default::default()
    };
    active.updated_at = Set(Utc::now());
    match active.update(db).await {
        Ok(_) => Ok(()),
        Err(sea_orm::DbErr::RecordNotFound(_)) | Err(sea_orm::DbErr::RecordNotUpdated) => {
            Err(AppError::NotFound(format!("journey id {journey_id}")))
        }
        Err(err) => Err(err.into()),
    }
}

async fn touch_user_journey_with_conn<C: ConnectionTrait>(
    db: &C,
    user_journey_id: i64,
) -> Result<(), AppError> {
    let mut active = user_journey::ActiveModel {
        id: Set(user_journey_id),
        ..Default::default()
    };
    active.updated_at = Set(Utc::now());
    match active.update(db).await {
        Ok(_) => Ok(()),
        Err(sea_orm::DbErr::RecordNotFound(_)) | Err(sea_orm::DbErr::RecordNotUpdated) => {
            Err(AppError::NotFound(format!("user journey id {user_journey_id}")))
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) async fn finalize_transaction<T>(
    txn: DatabaseTransaction,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                return Err(rollback_err.into());
            }
            Err(err)
        }
    }
}

fn unique_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for id in ids {
        if seen.insert(*id) {
            unique.push(*id);
        }
    }
    unique
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn ensure_non_empty(label: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{label} cannot be empty")));
    }
    Ok(())
}
