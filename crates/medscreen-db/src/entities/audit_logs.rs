use sea_orm::entity::prelude::*;
use serde::Serialize;

/// Append-only change record. Rows are inserted by the recorder and never
/// updated or deleted by the application.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub user_id: Option<i64>,
    pub action: String,
    pub entity_name: String,
    pub entity_id: i64,
    #[sea_orm(column_type = "Text")]
    pub old_values: String,
    #[sea_orm(column_type = "Text")]
    pub new_values: String,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id"
    )]
    Users,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
