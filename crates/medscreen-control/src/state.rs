use std::sync::Arc;

use medscreen_db::entities::{appointments, patients, users};
use medscreen_db::sea_orm::DatabaseConnection;

use crate::audit::Recorder;
use crate::config::Config;
use crate::store::AuditedStore;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<Config>,
    pub patients: AuditedStore<patients::Entity>,
    pub appointments: AuditedStore<appointments::Entity>,
    pub users: AuditedStore<users::Entity>,
}

impl AppState {
    pub fn new(db: Arc<DatabaseConnection>, config: Config) -> Self {
        let recorder = Recorder::with_database(db.clone());
        Self::with_recorder(db, config, recorder)
    }

    pub fn with_recorder(db: Arc<DatabaseConnection>, config: Config, recorder: Recorder) -> Self {
        Self {
            patients: AuditedStore::new(db.clone(), recorder.clone()),
            appointments: AuditedStore::new(db.clone(), recorder.clone()),
            users: AuditedStore::new(db.clone(), recorder),
            db,
            config: Arc::new(config),
        }
    }
}
