use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Duration, FixedOffset};
use medscreen_db::entities::appointments;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Deserialize;

use crate::audit::AuditContext;
use crate::auth::{AuthUser, Role};
use crate::error::ApiError;
use crate::pagination::{PageMeta, PageParams, Paged};
use crate::state::AppState;

const DEFAULT_LIMIT: u64 = 10;
const DEFAULT_DURATION_MINUTES: i32 = 30;

const READERS: [Role; 4] = Role::ALL;
const WRITERS: [Role; 3] = [Role::Admin, Role::Doctor, Role::Receptionist];
const DELETERS: [Role; 2] = [Role::Admin, Role::Receptionist];

pub const APPOINTMENT_TYPES: [&str; 4] = ["consultation", "checkup", "follow-up", "emergency"];
pub const STATUSES: [&str; 5] = ["scheduled", "confirmed", "completed", "cancelled", "no-show"];

// Statuses that no longer block the doctor's calendar.
const INACTIVE_STATUSES: [&str; 2] = ["cancelled", "no-show"];

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AppointmentValidationError {
    #[error("patient_id is required")]
    PatientMissing,
    #[error("doctor_id is required")]
    DoctorMissing,
    #[error("duration_minutes must be positive")]
    Duration,
    #[error("invalid appointment_type: must be one of consultation, checkup, follow-up, emergency")]
    AppointmentType,
    #[error("invalid status: must be one of scheduled, confirmed, completed, cancelled, no-show")]
    Status,
}

impl AppointmentValidationError {
    fn field(&self) -> &'static str {
        match self {
            Self::PatientMissing => "patient_id",
            Self::DoctorMissing => "doctor_id",
            Self::Duration => "duration_minutes",
            Self::AppointmentType => "appointment_type",
            Self::Status => "status",
        }
    }
}

impl From<AppointmentValidationError> for ApiError {
    fn from(err: AppointmentValidationError) -> Self {
        ApiError::invalid_param(err.to_string()).with_field(err.field(), err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppointmentInput {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub appointment_date: DateTime<FixedOffset>,
    pub duration_minutes: Option<i32>,
    pub appointment_type: String,
    pub status: Option<String>,
    pub notes: Option<String>,
}

impl AppointmentInput {
    fn duration(&self) -> i32 {
        self.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES)
    }

    fn status(&self) -> &str {
        self.status.as_deref().unwrap_or("scheduled")
    }

    pub fn validate(&self) -> Result<(), AppointmentValidationError> {
        if self.patient_id <= 0 {
            return Err(AppointmentValidationError::PatientMissing);
        }
        if self.doctor_id <= 0 {
            return Err(AppointmentValidationError::DoctorMissing);
        }
        if self.duration() <= 0 {
            return Err(AppointmentValidationError::Duration);
        }
        if !APPOINTMENT_TYPES.contains(&self.appointment_type.as_str()) {
            return Err(AppointmentValidationError::AppointmentType);
        }
        if !STATUSES.contains(&self.status()) {
            return Err(AppointmentValidationError::Status);
        }
        Ok(())
    }
}

/// Time slot a doctor is booked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: Option<i64>,
    pub doctor_id: i64,
    pub start: DateTime<FixedOffset>,
    pub duration_minutes: i32,
}

impl Slot {
    pub fn end(&self) -> DateTime<FixedOffset> {
        self.start + Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl From<&appointments::Model> for Slot {
    fn from(m: &appointments::Model) -> Self {
        Self {
            id: Some(m.id),
            doctor_id: m.doctor_id,
            start: m.appointment_date,
            duration_minutes: m.duration_minutes,
        }
    }
}

/// First active appointment of the same doctor that overlaps `candidate`.
pub fn find_conflict<'a>(
    candidate: &Slot,
    existing: &'a [appointments::Model],
) -> Option<&'a appointments::Model> {
    existing.iter().find(|m| {
        Some(m.id) != candidate.id
            && m.doctor_id == candidate.doctor_id
            && !INACTIVE_STATUSES.contains(&m.status.as_str())
            && Slot::from(*m).overlaps(candidate)
    })
}

/// An edit must be checked against the calendar when it ends up active and
/// either moves the slot or revives a cancelled/no-show appointment.
fn needs_conflict_check(current: &appointments::Model, slot: &Slot, new_status: &str) -> bool {
    if INACTIVE_STATUSES.contains(&new_status) {
        return false;
    }
    let rescheduled = *slot != Slot::from(current);
    let reactivated = INACTIVE_STATUSES.contains(&current.status.as_str());
    rescheduled || reactivated
}

async fn nearby_appointments(
    db: &DatabaseConnection,
    candidate: &Slot,
) -> Result<Vec<appointments::Model>, DbErr> {
    let window_start = candidate.start - Duration::hours(24);
    let window_end = candidate.end() + Duration::hours(24);
    appointments::Entity::find()
        .filter(appointments::Column::DoctorId.eq(candidate.doctor_id))
        .filter(appointments::Column::AppointmentDate.between(window_start, window_end))
        .filter(appointments::Column::Status.is_not_in(INACTIVE_STATUSES))
        .all(db)
        .await
}

async fn ensure_no_conflict(
    state: &AppState,
    ctx: &AuditContext,
    candidate: &Slot,
) -> Result<(), ApiError> {
    let nearby = nearby_appointments(&state.db, candidate)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    if let Some(existing) = find_conflict(candidate, &nearby) {
        return Err(ApiError::conflict(format!(
            "appointment conflicts with appointment {} for this doctor",
            existing.id
        ))
        .with_request_id(&ctx.request_id));
    }
    Ok(())
}

async fn find(
    state: &AppState,
    ctx: &AuditContext,
    id: i64,
) -> Result<appointments::Model, ApiError> {
    appointments::Entity::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?
        .ok_or_else(|| ApiError::not_found("appointment not found").with_request_id(&ctx.request_id))
}

pub async fn create_appointment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Json(input): Json<AppointmentInput>,
) -> Result<(StatusCode, Json<appointments::Model>), ApiError> {
    user.require(&WRITERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;
    input
        .validate()
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    let slot = Slot {
        id: None,
        doctor_id: input.doctor_id,
        start: input.appointment_date,
        duration_minutes: input.duration(),
    };
    if !INACTIVE_STATUSES.contains(&input.status()) {
        ensure_no_conflict(&state, &ctx, &slot).await?;
    }

    let now = chrono::Utc::now();
    let model = appointments::ActiveModel {
        id: NotSet,
        patient_id: Set(input.patient_id),
        doctor_id: Set(input.doctor_id),
        created_by_user_id: Set(user.user_id),
        appointment_date: Set(input.appointment_date),
        duration_minutes: Set(slot.duration_minutes),
        appointment_type: Set(input.appointment_type.clone()),
        status: Set(input.status().to_string()),
        notes: Set(input.notes.clone()),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    };

    let created = state
        .appointments
        .insert(&ctx, model)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(appointment_id = created.id, doctor_id = created.doctor_id, "appointment created");
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Default, Deserialize)]
pub struct AppointmentFilter {
    pub doctor_id: Option<i64>,
    pub patient_id: Option<i64>,
    pub status: Option<String>,
}

pub async fn list_appointments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Query(page): Query<PageParams>,
    Query(filter): Query<AppointmentFilter>,
) -> Result<Json<Paged<appointments::Model>>, ApiError> {
    user.require(&READERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;

    let mut select = appointments::Entity::find();
    if let Some(doctor_id) = filter.doctor_id {
        select = select.filter(appointments::Column::DoctorId.eq(doctor_id));
    }
    if let Some(patient_id) = filter.patient_id {
        select = select.filter(appointments::Column::PatientId.eq(patient_id));
    }
    if let Some(status) = filter.status {
        if !STATUSES.contains(&status.as_str()) {
            return Err(ApiError::from(AppointmentValidationError::Status)
                .with_request_id(&ctx.request_id));
        }
        select = select.filter(appointments::Column::Status.eq(status));
    }

    let (page, limit) = page.resolve(DEFAULT_LIMIT);
    let total = select
        .clone()
        .count(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let data = select
        .order_by_asc(appointments::Column::AppointmentDate)
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

pub async fn get_appointment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Json<appointments::Model>, ApiError> {
    user.require(&READERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;
    Ok(Json(find(&state, &ctx, id).await?))
}

pub async fn update_appointment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Json(input): Json<AppointmentInput>,
) -> Result<Json<appointments::Model>, ApiError> {
    user.require(&WRITERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;
    input
        .validate()
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    let mut appointment = find(&state, &ctx, id).await?;
    let slot = Slot {
        id: Some(id),
        doctor_id: input.doctor_id,
        start: input.appointment_date,
        duration_minutes: input.duration(),
    };
    if needs_conflict_check(&appointment, &slot, input.status()) {
        ensure_no_conflict(&state, &ctx, &slot).await?;
    }

    appointment.patient_id = input.patient_id;
    appointment.doctor_id = input.doctor_id;
    appointment.appointment_date = input.appointment_date;
    appointment.duration_minutes = slot.duration_minutes;
    appointment.appointment_type = input.appointment_type.clone();
    appointment.status = input.status().to_string();
    appointment.notes = input.notes.clone();
    appointment.updated_at = chrono::Utc::now().into();

    let updated = state
        .appointments
        .update(&ctx, appointment)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(appointment_id = updated.id, status = %updated.status, "appointment updated");
    Ok(Json(updated))
}

pub async fn delete_appointment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require(&DELETERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;

    let appointment = find(&state, &ctx, id).await?;
    state
        .appointments
        .delete(&ctx, appointment)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(appointment_id = id, "appointment deleted");
    Ok(StatusCode::NO_CONTENT)
}
