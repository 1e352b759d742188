use sea_orm::entity::prelude::*;

use super::{step, user_journey, user_task};
use crate::error::AppError;
use crate::model::UserStepStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "user_steps")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_journey_id: i64,
    pub step_id: i64,
    pub status: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    pub fn status(&self) -> Result<UserStepStatus, AppError> {
        UserStepStatus::parse(&self.status)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status(), Ok(status) if status.is_done())
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.status(), Ok(status) if status.is_waiting())
    }
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    UserJourney,
    Step,
    UserTask,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::UserJourney => Entity::belongs_to(user_journey::Entity)
                .from(Column::UserJourneyId)
                .to(user_journey::Column::Id)
                .into(),
            Self::Step => Entity::belongs_to(step::Entity)
                .from(Column::StepId)
                .to(step::Column::Id)
                .into(),
            Self::UserTask => Entity::has_many(user_task::Entity).into(),
        }
    }
}

impl Related<user_journey::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserJourney.def()
    }
}

impl Related<step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Step.def()
    }
}

impl Related<user_task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserTask.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
