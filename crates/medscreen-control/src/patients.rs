use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::NaiveDate;
use medscreen_db::entities::patients;
use sea_orm::{EntityTrait, NotSet, PaginatorTrait, QueryOrder, QuerySelect, Set};
use serde::{Deserialize, Serialize};

use crate::audit::AuditContext;
use crate::auth::{AuthUser, Role};
use crate::error::ApiError;
use crate::pagination::{PageMeta, PageParams, Paged};
use crate::state::AppState;

const DEFAULT_LIMIT: u64 = 10;

const READERS: [Role; 4] = Role::ALL;
const WRITERS: [Role; 2] = [Role::Admin, Role::Receptionist];
const DELETERS: [Role; 1] = [Role::Admin];

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PatientValidationError {
    #[error("first_name is required")]
    FirstNameMissing,
    #[error("last_name is required")]
    LastNameMissing,
    #[error("tc_number must be exactly 11 digits")]
    TcNumberLength,
    #[error("tc_number must contain only digits")]
    TcNumberNotNumeric,
    #[error("gender must be either 'male' or 'female'")]
    Gender,
}

impl PatientValidationError {
    fn field(&self) -> &'static str {
        match self {
            Self::FirstNameMissing => "first_name",
            Self::LastNameMissing => "last_name",
            Self::TcNumberLength | Self::TcNumberNotNumeric => "tc_number",
            Self::Gender => "gender",
        }
    }
}

impl From<PatientValidationError> for ApiError {
    fn from(err: PatientValidationError) -> Self {
        ApiError::invalid_param(err.to_string()).with_field(err.field(), err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatientInput {
    pub user_id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub tc_number: String,
    pub birth_date: NaiveDate,
    pub gender: String,
    #[serde(default)]
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub blood_type: Option<String>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    pub primary_doctor_id: Option<i64>,
}

impl PatientInput {
    pub fn validate(&self) -> Result<(), PatientValidationError> {
        if self.first_name.trim().is_empty() {
            return Err(PatientValidationError::FirstNameMissing);
        }
        if self.last_name.trim().is_empty() {
            return Err(PatientValidationError::LastNameMissing);
        }
        if self.tc_number.len() != 11 {
            return Err(PatientValidationError::TcNumberLength);
        }
        if !self.tc_number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PatientValidationError::TcNumberNotNumeric);
        }
        if !matches!(self.gender.as_str(), "male" | "female") {
            return Err(PatientValidationError::Gender);
        }
        Ok(())
    }

    fn apply(self, model: &mut patients::Model) {
        model.user_id = self.user_id;
        model.first_name = self.first_name.trim().to_string();
        model.last_name = self.last_name.trim().to_string();
        model.tc_number = self.tc_number;
        model.birth_date = self.birth_date;
        model.gender = self.gender;
        model.phone = self.phone;
        model.email = self.email;
        model.address = self.address;
        model.emergency_contact_name = self.emergency_contact_name;
        model.emergency_contact_phone = self.emergency_contact_phone;
        model.blood_type = self.blood_type;
        model.height = self.height;
        model.weight = self.weight;
        model.primary_doctor_id = self.primary_doctor_id;
    }

    fn into_active_model(self) -> patients::ActiveModel {
        let now = chrono::Utc::now();
        patients::ActiveModel {
            id: NotSet,
            user_id: Set(self.user_id),
            first_name: Set(self.first_name.trim().to_string()),
            last_name: Set(self.last_name.trim().to_string()),
            tc_number: Set(self.tc_number),
            birth_date: Set(self.birth_date),
            gender: Set(self.gender),
            phone: Set(self.phone),
            email: Set(self.email),
            address: Set(self.address),
            emergency_contact_name: Set(self.emergency_contact_name),
            emergency_contact_phone: Set(self.emergency_contact_phone),
            blood_type: Set(self.blood_type),
            height: Set(self.height),
            weight: Set(self.weight),
            primary_doctor_id: Set(self.primary_doctor_id),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
    }
}

/// Body mass index from height in centimetres and weight in kilograms,
/// rounded to one decimal.
pub fn bmi(height_cm: Option<f64>, weight_kg: Option<f64>) -> Option<f64> {
    let (h, w) = (height_cm?, weight_kg?);
    if h <= 0.0 || w <= 0.0 {
        return None;
    }
    let metres = h / 100.0;
    Some((w / (metres * metres) * 10.0).round() / 10.0)
}

#[derive(Debug, Serialize)]
pub struct PatientView {
    #[serde(flatten)]
    pub patient: patients::Model,
    pub bmi: Option<f64>,
}

impl From<patients::Model> for PatientView {
    fn from(patient: patients::Model) -> Self {
        let bmi = bmi(patient.height, patient.weight);
        Self { patient, bmi }
    }
}

async fn find(state: &AppState, ctx: &AuditContext, id: i64) -> Result<patients::Model, ApiError> {
    patients::Entity::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?
        .ok_or_else(|| ApiError::not_found("patient not found").with_request_id(&ctx.request_id))
}

pub async fn create_patient(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Json(input): Json<PatientInput>,
) -> Result<(StatusCode, Json<PatientView>), ApiError> {
    user.require(&WRITERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;
    input
        .validate()
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    let created = state
        .patients
        .insert(&ctx, input.into_active_model())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(patient_id = created.id, actor = ?ctx.actor_id, "patient created");
    Ok((StatusCode::CREATED, Json(created.into())))
}

pub async fn list_patients(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Query(page): Query<PageParams>,
) -> Result<Json<Paged<PatientView>>, ApiError> {
    user.require(&READERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;

    let (page, limit) = page.resolve(DEFAULT_LIMIT);
    let select = patients::Entity::find();
    let total = select
        .clone()
        .count(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let rows = select
        .order_by_asc(patients::Column::Id)
        .offset(PageMeta::offset(page, limit))
        .limit(limit)
        .all(&*state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(Paged {
        data: rows.into_iter().map(PatientView::from).collect(),
        meta: PageMeta::new(page, limit, total),
    }))
}

pub async fn get_patient(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<Json<PatientView>, ApiError> {
    user.require(&READERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;
    Ok(Json(find(&state, &ctx, id).await?.into()))
}

pub async fn update_patient(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
    Json(input): Json<PatientInput>,
) -> Result<Json<PatientView>, ApiError> {
    user.require(&WRITERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;
    input
        .validate()
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    let mut patient = find(&state, &ctx, id).await?;
    input.apply(&mut patient);
    patient.updated_at = chrono::Utc::now().into();

    let updated = state
        .patients
        .update(&ctx, patient)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(patient_id = updated.id, actor = ?ctx.actor_id, "patient updated");
    Ok(Json(updated.into()))
}

pub async fn delete_patient(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ctx: AuditContext,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require(&DELETERS)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;

    let patient = find(&state, &ctx, id).await?;
    state
        .patients
        .delete(&ctx, patient)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    tracing::info!(patient_id = id, actor = ?ctx.actor_id, "patient deleted");
    Ok(StatusCode::NO_CONTENT)
}
