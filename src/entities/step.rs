use sea_orm::entity::prelude::*;

use super::{journey, task, user_step};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "steps")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub journey_id: i64,
    pub title: String,
    pub has_app: bool,
    pub sort_order: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Journey,
    Task,
    UserStep,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Journey => Entity::belongs_to(journey::Entity)
                .from(Column::JourneyId)
                .to(journey::Column::Id)
                .into(),
            Self::Task => Entity::has_many(task::Entity).into(),
            Self::UserStep => Entity::has_many(user_step::Entity).into(),
        }
    }
}

impl Related<journey::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Journey.def()
    }
}

impl Related<task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Task.def()
    }
}

impl Related<user_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserStep.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
