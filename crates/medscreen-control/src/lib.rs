pub mod appointments;
pub mod audit;
pub mod audit_logs;
pub mod auth;
pub mod config;
pub mod error;
pub mod pagination;
pub mod patients;
pub mod request_meta;
pub mod security;
pub mod state;
pub mod store;
pub mod users;

use axum::{
    Json, Router,
    extract::State,
    middleware,
    routing::get,
};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    read_only: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        read_only: state.config.read_only,
    })
}

pub fn router(state: AppState) -> Router {
    // Layers run outside-in: auth first, then the read-only switch.
    let api = Router::new()
        .route("/auth/whoami", get(auth::whoami))
        .route(
            "/patients",
            get(patients::list_patients).post(patients::create_patient),
        )
        .route(
            "/patients/:id",
            get(patients::get_patient)
                .put(patients::update_patient)
                .delete(patients::delete_patient),
        )
        .route(
            "/appointments",
            get(appointments::list_appointments).post(appointments::create_appointment),
        )
        .route(
            "/appointments/:id",
            get(appointments::get_appointment)
                .put(appointments::update_appointment)
                .delete(appointments::delete_appointment),
        )
        .route("/users", get(users::list_users).post(users::create_user))
        .route(
            "/users/:id",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        .route("/audit-logs", get(audit_logs::list_audit_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::read_only_guard,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::auth_guard,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(security::request_meta))
        .with_state(state)
}
