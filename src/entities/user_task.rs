use sea_orm::entity::prelude::*;

use super::{task, user_step};
use crate::model::UserTaskStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "user_tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_step_id: i64,
    pub task_id: i64,
    pub status: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    pub fn is_done(&self) -> bool {
        self.status == UserTaskStatus::Done.as_str()
    }
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    UserStep,
    Task,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::UserStep => Entity::belongs_to(user_step::Entity)
                .from(Column::UserStepId)
                .to(user_step::Column::Id)
                .into(),
            Self::Task => Entity::belongs_to(task::Entity)
                .from(Column::TaskId)
                .to(task::Column::Id)
                .into(),
        }
    }
}

impl Related<user_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserStep.def()
    }
}

impl Related<task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Task.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
