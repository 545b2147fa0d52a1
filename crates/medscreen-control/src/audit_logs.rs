//! Read-only access to the `audit_logs` collection.

use axum::{
    Extension, Json,
    extract::{Query, State},
};
use medscreen_db::entities::{audit_logs, users};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::audit::AuditContext;
use crate::auth::{AuthUser, Role};
use crate::error::ApiError;
use crate::pagination::{PageMeta, PageParams, Paged};
use crate::state::AppState;

const DEFAULT_LIMIT: u64 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct AuditLogQuery {
    pub entity_name: Option<String>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditLogFilter {
    Entity { name: String, id: i64 },
    User(i64),
    All,
}

impl AuditLogQuery {
    /// An entity filter needs both name and id and takes precedence over the
    /// user filter.
    pub fn filter(&self) -> AuditLogFilter {
        let name = self
            .entity_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        match (name, self.entity_id, self.user_id) {
            (Some(name), Some(id), _) => AuditLogFilter::Entity {
                name: name.to_string(),
                id,
            },
            (_, _, Some(user_id)) => AuditLogFilter::User(user_id),
            _ => AuditLogFilter::All,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditUser {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct AuditLogView {
    #[serde(flatten)]
    pub log: audit_logs::Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AuditUser>,
}

pub async fn list(
    db: &DatabaseConnection,
    filter: &AuditLogFilter,
    page: u64,
    limit: u64,
) -> Result<(Vec<AuditLogView>, u64), DbErr> {
    let select = match filter {
        AuditLogFilter::Entity { name, id } => audit_logs::Entity::find()
            .filter(audit_logs::Column::EntityName.eq(name.clone()))
            .filter(audit_logs::Column::EntityId.eq(*id)),
        AuditLogFilter::User(user_id) => {
            audit_logs::Entity::find().filter(audit_logs::Column::UserId.eq(*user_id))
        }
        AuditLogFilter::All => audit_logs::Entity::find(),
    };

    let total = select.clone().count(db).await?;

    let rows = select
        .order_by_desc(audit_logs::Column::CreatedAt)
        .order_by_desc(audit_logs::Column::Id)
        .offset(PageMeta::offset(page, limit))
        .limit(limit)
        .find_also_related(users::Entity)
        .all(db)
        .await?;

    let views = rows
        .into_iter()
        .map(|(log, user)| AuditLogView {
            log,
            user: user.map(|u| AuditUser {
                id: u.id,
                username: u.username,
                full_name: u.full_name,
                role: u.role,
            }),
        })
        .collect();

    Ok((views, total))
}

pub async fn list_audit_logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Query(page): Query<PageParams>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Paged<AuditLogView>>, ApiError> {
    user.require(&[Role::Admin])
        .map_err(|e| e.with_request_id(&ctx.request_id))?;

    let (page, limit) = page.resolve(DEFAULT_LIMIT);
    let (data, total) = list(&state.db, &query.filter(), page, limit)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(Paged {
        data,
        meta: PageMeta::new(page, limit, total),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_filter_needs_name_and_id() {
        let q = AuditLogQuery {
            entity_name: Some("patients".to_string()),
            entity_id: Some(42),
            user_id: Some(1),
        };
        assert_eq!(
            q.filter(),
            AuditLogFilter::Entity {
                name: "patients".to_string(),
                id: 42
            }
        );

        let q = AuditLogQuery {
            entity_name: Some("patients".to_string()),
            entity_id: None,
            user_id: Some(1),
        };
        assert_eq!(q.filter(), AuditLogFilter::User(1));

        let q = AuditLogQuery {
            entity_name: Some("  ".to_string()),
            entity_id: Some(3),
            user_id: None,
        };
        assert_eq!(q.filter(), AuditLogFilter::All);
    }

    #[test]
    fn empty_query_lists_everything() {
        assert_eq!(AuditLogQuery::default().filter(), AuditLogFilter::All);
    }
}
