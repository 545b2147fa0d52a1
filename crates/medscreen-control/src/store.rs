use std::marker::PhantomData;
use std::sync::Arc;

use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, DatabaseConnection, DbErr, DeleteResult, EntityTrait,
    IntoActiveModel,
};
use serde::Serialize;

use crate::audit::{AuditContext, EntityMeta, Recorder};

/// Write path for one entity type with change capture around every mutation.
///
/// Creates are recorded after the insert returns (so generated ids are in the
/// snapshot); updates and deletes are recorded before the statement runs.
/// Recording never changes the result of the write.
pub struct AuditedStore<E: EntityTrait> {
    db: Arc<DatabaseConnection>,
    recorder: Recorder,
    meta: EntityMeta,
    _entity: PhantomData<fn() -> E>,
}

impl<E: EntityTrait> Clone for AuditedStore<E> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            recorder: self.recorder.clone(),
            meta: self.meta.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> AuditedStore<E>
where
    E: EntityTrait,
    E::Model: Serialize + IntoActiveModel<E::ActiveModel> + Send + Sync,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
{
    pub fn new(db: Arc<DatabaseConnection>, recorder: Recorder) -> Self {
        Self {
            db,
            recorder,
            meta: EntityMeta::of::<E>(),
            _entity: PhantomData,
        }
    }

    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    /// Reads are not audited; use the connection directly.
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn insert(&self, ctx: &AuditContext, model: E::ActiveModel) -> Result<E::Model, DbErr> {
        let created = model.insert(&*self.db).await?;
        self.recorder.created(ctx, &self.meta, &created).await;
        Ok(created)
    }

    /// Writes every column of `model`, which carries the edited state.
    pub async fn update(&self, ctx: &AuditContext, model: E::Model) -> Result<E::Model, DbErr> {
        self.recorder.updated(ctx, &self.meta, &model).await;
        model.into_active_model().reset_all().update(&*self.db).await
    }

    pub async fn delete(&self, ctx: &AuditContext, model: E::Model) -> Result<DeleteResult, DbErr> {
        self.recorder.deleted(ctx, &self.meta, &model).await;
        model.into_active_model().delete(&*self.db).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use medscreen_db::entities::patients;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, NotSet};

    use super::*;
    use crate::audit::AuditAction;
    use crate::audit::testing::{FailingSink, MemorySink};

    fn patient(id: i64) -> patients::Model {
        let now = Utc::now().fixed_offset();
        patients::Model {
            id,
            user_id: None,
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            tc_number: "12345678901".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 4, 12).unwrap(),
            gender: "female".to_string(),
            phone: "+905551112233".to_string(),
            email: None,
            address: None,
            emergency_contact_name: None,
            emergency_contact_phone: None,
            blood_type: Some("A+".to_string()),
            height: Some(168.0),
            weight: Some(61.5),
            primary_doctor_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn new_patient(model: &patients::Model) -> patients::ActiveModel {
        let mut active = model.clone().into_active_model().reset_all();
        active.id = NotSet;
        active
    }

    fn ctx() -> AuditContext {
        AuditContext {
            actor_id: Some(1),
            request_id: "req-9".to_string(),
            source_ip: "192.168.1.20".to_string(),
            user_agent: "medscreen-tests".to_string(),
        }
    }

    fn store(
        db: sea_orm::DatabaseConnection,
        recorder: Recorder,
    ) -> AuditedStore<patients::Entity> {
        AuditedStore::new(Arc::new(db), recorder)
    }

    #[tokio::test]
    async fn insert_records_generated_id() {
        let stored = patient(42);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![stored.clone()]])
            .into_connection();
        let sink = Arc::new(MemorySink::default());
        let store = store(db, Recorder::new(sink.clone()));

        let created = store.insert(&ctx(), new_patient(&stored)).await.unwrap();
        assert_eq!(created.id, 42);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Create);
        assert_eq!(entries[0].entity_name, "patients");
        assert_eq!(entries[0].entity_id, 42);
        assert_eq!(entries[0].old_value, "");
        assert_eq!(entries[0].new_value, serde_json::to_string(&created).unwrap());
        assert_eq!(entries[0].actor_id, Some(1));
    }

    #[tokio::test]
    async fn failed_insert_records_nothing() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Custom("duplicate tc_number".to_string())])
            .into_connection();
        let sink = Arc::new(MemorySink::default());
        let store = store(db, Recorder::new(sink.clone()));

        let res = store.insert(&ctx(), new_patient(&patient(0))).await;
        assert!(res.is_err());
        assert!(sink.entries().is_empty());
    }

    #[tokio::test]
    async fn update_is_recorded_before_the_write() {
        let mut edited = patient(5);
        edited.phone = "+905550000000".to_string();
        // The write fails; the entry must already exist.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Custom("connection reset".to_string())])
            .into_connection();
        let sink = Arc::new(MemorySink::default());
        let store = store(db, Recorder::new(sink.clone()));

        assert!(store.update(&ctx(), edited.clone()).await.is_err());

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Update);
        assert_eq!(entries[0].entity_id, 5);
        assert_eq!(entries[0].old_value, "");
        assert_eq!(entries[0].new_value, serde_json::to_string(&edited).unwrap());
    }

    #[tokio::test]
    async fn update_returns_written_row() {
        let edited = patient(5);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![edited.clone()]])
            .into_connection();
        let sink = Arc::new(MemorySink::default());
        let store = store(db, Recorder::new(sink.clone()));

        let updated = store.update(&ctx(), edited.clone()).await.unwrap();
        assert_eq!(updated, edited);
        assert_eq!(sink.entries().len(), 1);
    }

    #[tokio::test]
    async fn delete_records_target() {
        let target = patient(7);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();
        let sink = Arc::new(MemorySink::default());
        let store = store(db, Recorder::new(sink.clone()));

        let res = store.delete(&ctx(), target.clone()).await.unwrap();
        assert_eq!(res.rows_affected, 1);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Delete);
        assert_eq!(entries[0].entity_id, 7);
        assert_eq!(entries[0].old_value, serde_json::to_string(&target).unwrap());
        assert_eq!(entries[0].new_value, "");
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_writes() {
        let stored = patient(42);
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![stored.clone()], vec![stored.clone()]])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();
        let store = store(db, Recorder::new(Arc::new(FailingSink)));

        let created = store.insert(&ctx(), new_patient(&stored)).await.unwrap();
        assert_eq!(created.id, 42);
        let updated = store.update(&ctx(), created).await.unwrap();
        assert_eq!(updated.id, 42);
        let deleted = store.delete(&ctx(), updated).await.unwrap();
        assert_eq!(deleted.rows_affected, 1);
    }
}
