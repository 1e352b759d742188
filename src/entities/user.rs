use sea_orm::entity::prelude::*;

use super::user_journey;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub email: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    UserJourney,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::UserJourney => Entity::has_many(user_journey::Entity).into(),
        }
    }
}

impl Related<user_journey::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserJourney.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
