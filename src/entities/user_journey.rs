use sea_orm::entity::prelude::*;

use super::{journey, user, user_step};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "user_journeys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub journey_id: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    User,
    Journey,
    UserStep,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::User => Entity::belongs_to(user::Entity)
                .from(Column::UserId)
                .to(user::Column::Id)
                .into(),
            Self::Journey => Entity::belongs_to(journey::Entity)
                .from(Column::JourneyId)
                .to(journey::Column::Id)
                .into(),
            Self::UserStep => Entity::has_many(user_step::Entity).into(),
        }
    }
}

impl Related<user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<journey::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Journey.def()
    }
}

impl Related<user_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserStep.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
