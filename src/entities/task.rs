use sea_orm::entity::prelude::*;

use super::{step, user_task};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub step_id: i64,
    pub title: String,
    pub sort_order: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Step,
    UserTask,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Step => Entity::belongs_to(step::Entity)
                .from(Column::StepId)
                .to(step::Column::Id)
                .into(),
            Self::UserTask => Entity::has_many(user_task::Entity).into(),
        }
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
