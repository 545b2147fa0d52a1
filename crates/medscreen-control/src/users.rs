//! Staff accounts. Every route here is admin only.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use medscreen_db::entities::users;
use sea_orm::{
    ColumnTrait, EntityTrait, NotSet, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::Deserialize;

use crate::audit::AuditContext;
use crate::auth::{AuthUser, Role};
use crate::error::ApiError;
use crate::pagination::{PageMeta, PageParams, Paged};
use crate::state::AppState;

const DEFAULT_LIMIT: u64 = 10;
const MAX_USERNAME_LEN: usize = 100;
const MAX_FULL_NAME_LEN: usize = 200;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum UserValidationError {
    #[error("username is required")]
    UsernameMissing,
    #[error("username must be at most 100 characters")]
    UsernameTooLong,
    #[error("full_name is required")]
    FullNameMissing,
    #[error("full_name must be at most 200 characters")]
    FullNameTooLong,
    #[error("invalid role: must be one of admin, doctor, nurse, receptionist")]
    Role,
}

impl UserValidationError {
    fn field(&self) -> &'static str {
        match self {
            Self::UsernameMissing | Self::UsernameTooLong => "username",
            Self::FullNameMissing | Self::FullNameTooLong => "full_name",
            Self::Role => "role",
        }
    }
}

impl From<UserValidationError> for ApiError {
    fn from(err: UserValidationError) -> Self {
        ApiError::invalid_param(err.to_string()).with_field(err.field(), err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInput {
    pub username: String,
    pub full_name: String,
    pub role: String,
}

impl UserInput {
    /// Returns the parsed role on success.
    pub fn validate(&self) -> Result<Role, UserValidationError> {
        let username = self.username.trim();
        if username.is_empty() {
            return Err(UserValidationError::UsernameMissing);
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(UserValidationError::UsernameTooLong);
        }
        let full_name = self.full_name.trim();
        if full_name.is_empty() {
            return Err(UserValidationError::FullNameMissing);
        }
        if full_name.chars().count() > MAX_FULL_NAME_LEN {
            return Err(UserValidationError::FullNameTooLong);
        }
        Role::parse(&self.role).ok_or(UserValidationError::Role)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UserFilter {
    pub role: Option<String>,
}

fn require_admin(user: &AuthUser, ctx: &AuditContext) -> Result<(), ApiError> {
    user.require(&[Role::Admin])
        .map_err(|e| e.with_request_id(&ctx.request_id))
}

fn validated(input: &UserInput, ctx: &AuditContext) -> Result<Role, ApiError> {
    input
        .validate()
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))
}

async fn find(state: &AppState, ctx: &AuditContext, id: i64) -> Result<users::Model, ApiError> {
    users::Entity::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?
        .ok_or_else(|| ApiError::not_found("user not found").with_request_id(&ctx.request_id))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Json(input): Json<UserInput>,
) -> Result<(StatusCode, Json<users::Model>), ApiError> {
    require_admin(&user, &ctx)?;
    let role = validated(&input, &ctx)?;

    let model = users::ActiveModel {
        id: NotSet,
        username: Set(input.username.trim().to_string()),
        full_name: Set(input.full_name.trim().to_string()),
        role: Set(role.as_str().to_string()),
        created_at: Set(chrono::Utc::now().into()),
    };

    let created = state
        .users
        .insert(&ctx, model)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(user_id = created.id, role = %created.role, "user created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Query(page): Query<PageParams>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Paged<users::Model>>, ApiError> {
    require_admin(&user, &ctx)?;

    let mut select = users::Entity::find();
    if let Some(role) = filter.role.as_deref() {
        let role = Role::parse(role).ok_or_else(|| {
            ApiError::from(UserValidationError::Role).with_request_id(&ctx.request_id)
        })?;
        select = select.filter(users::Column::Role.eq(role.as_str()));
    }

    let (page, limit) = page.resolve(DEFAULT_LIMIT);
    let total = select
        .clone()
        .count(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let data = select
        .order_by_asc(users::Column::Id)
        .offset(PageMeta::offset(page, limit))
        .limit(limit)
        .all(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(Paged {
        data,
        meta: PageMeta::new(page, limit, total),
    }))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Json<users::Model>, ApiError> {
    require_admin(&user, &ctx)?;
    Ok(Json(find(&state, &ctx, id).await?))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Json(input): Json<UserInput>,
) -> Result<Json<users::Model>, ApiError> {
    require_admin(&user, &ctx)?;
    let role = validated(&input, &ctx)?;

    let mut account = find(&state, &ctx, id).await?;
    account.username = input.username.trim().to_string();
    account.full_name = input.full_name.trim().to_string();
    account.role = role.as_str().to_string();

    let updated = state
        .users
        .update(&ctx, account)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(user_id = updated.id, role = %updated.role, "user updated");
    Ok(Json(updated))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    require_admin(&user, &ctx)?;

    let account = find(&state, &ctx, id).await?;
    state
        .users
        .delete(&ctx, account)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(user_id = id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(role: &str) -> UserInput {
        UserInput {
            username: " dr.yilmaz ".to_string(),
            full_name: "Ayse Yilmaz".to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn accepts_known_roles() {
        assert_eq!(input("doctor").validate(), Ok(Role::Doctor));
        assert_eq!(input("receptionist").validate(), Ok(Role::Receptionist));
    }

    #[test]
    fn rejects_unknown_role_and_blank_names() {
        assert_eq!(input("Doctor").validate(), Err(UserValidationError::Role));
        assert_eq!(input("surgeon").validate(), Err(UserValidationError::Role));

        let mut u = input("nurse");
        u.username = "   ".to_string();
        assert_eq!(u.validate(), Err(UserValidationError::UsernameMissing));

        let mut u = input("nurse");
        u.full_name = "x".repeat(201);
        assert_eq!(u.validate(), Err(UserValidationError::FullNameTooLong));
    }

    #[test]
    fn role_error_names_the_field() {
        let err = ApiError::from(UserValidationError::Role);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.field_errors.contains_key("role"));
    }
}
