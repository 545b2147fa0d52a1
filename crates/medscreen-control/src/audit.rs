//! Change capture for persisted entities.
//!
//! Every create/update/delete that goes through [`crate::store::AuditedStore`]
//! produces one `audit_logs` row. Capture is best-effort: nothing here can fail
//! or alter the write that triggered it.

use std::sync::Arc;

use medscreen_db::entities::audit_logs;
use sea_orm::{
    DatabaseConnection, EntityName, EntityTrait, IdenStatic, Iterable, PrimaryKeyToColumn, Set,
};
use serde::Serialize;
use serde_json::Value;

pub const AUDIT_TABLE: &str = "audit_logs";

const FALLBACK_ID_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity and request metadata, captured when the write is issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditContext {
    pub actor_id: Option<i64>,
    pub request_id: String,
    pub source_ip: String,
    pub user_agent: String,
}

impl AuditContext {
    /// Context for writes issued by the service itself (seeding, maintenance).
    pub fn system() -> Self {
        Self::default()
    }
}

/// Logical name and declared primary-key fields of an audited entity type.
///
/// Field names refer to the serialized form of the entity, which for sea-orm
/// models matches the column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMeta {
    name: String,
    primary_key: Vec<String>,
}

impl EntityMeta {
    pub fn new(name: impl Into<String>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn of<E: EntityTrait>() -> Self {
        let name = E::default().table_name().to_string();
        let primary_key = E::PrimaryKey::iter()
            .map(|pk| pk.into_column().as_str().to_string())
            .collect();
        Self { name, primary_key }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_audit_table(&self) -> bool {
        self.name == AUDIT_TABLE
    }

    /// Resolves the numeric id of a serialized entity.
    ///
    /// The first declared primary-key field holding a non-zero value wins;
    /// otherwise an `id` field is consulted. Anything else resolves to `0`.
    pub fn resolve_entity_id(&self, snapshot: &Value) -> i64 {
        let Some(fields) = snapshot.as_object() else {
            return 0;
        };

        for name in &self.primary_key {
            if let Some(v) = fields.get(name).filter(|v| !is_zero(v)) {
                return as_entity_id(v);
            }
        }

        fields.get(FALLBACK_ID_FIELD).map(as_entity_id).unwrap_or(0)
    }
}

fn is_zero(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn as_entity_id(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .unwrap_or(0),
        _ => 0,
    }
}

struct Snapshot {
    text: String,
    value: Option<Value>,
}

impl Snapshot {
    fn take<T: Serialize + ?Sized>(entity: &T) -> Self {
        match serde_json::to_string(entity) {
            Ok(text) => {
                // Parsed back from the stored text so the id is read from
                // exactly what lands in the row.
                let value = serde_json::from_str(&text).ok();
                Self { text, value }
            }
            Err(err) => {
                tracing::debug!(%err, "audit snapshot not serializable");
                Self {
                    text: String::new(),
                    value: None,
                }
            }
        }
    }

    fn entity_id(&self, meta: &EntityMeta) -> i64 {
        self.value
            .as_ref()
            .map(|v| meta.resolve_entity_id(v))
            .unwrap_or(0)
    }
}

/// One change record, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub actor_id: Option<i64>,
    pub action: AuditAction,
    pub entity_name: String,
    pub entity_id: i64,
    pub old_value: String,
    pub new_value: String,
    pub source_ip: String,
    pub user_agent: String,
    pub request_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl AuditEntry {
    /// Builds the entry for one operation. Returns `None` for the audit table
    /// itself so that writing an entry can never produce another one.
    pub fn capture<T: Serialize + ?Sized>(
        ctx: &AuditContext,
        meta: &EntityMeta,
        action: AuditAction,
        old: Option<&T>,
        new: Option<&T>,
    ) -> Option<Self> {
        if meta.is_audit_table() {
            return None;
        }

        let old = old.map(Snapshot::take);
        let new = new.map(Snapshot::take);

        let mut entity_id = new.as_ref().map(|s| s.entity_id(meta)).unwrap_or(0);
        if entity_id == 0 {
            entity_id = old.as_ref().map(|s| s.entity_id(meta)).unwrap_or(0);
        }

        Some(Self {
            actor_id: ctx.actor_id,
            action,
            entity_name: meta.name().to_string(),
            entity_id,
            old_value: old.map(|s| s.text).unwrap_or_default(),
            new_value: new.map(|s| s.text).unwrap_or_default(),
            source_ip: ctx.source_ip.clone(),
            user_agent: ctx.user_agent.clone(),
            request_id: ctx.request_id.clone(),
            created_at: chrono::Utc::now(),
        })
    }

    fn into_active_model(self) -> audit_logs::ActiveModel {
        audit_logs::ActiveModel {
            request_id: Set(self.request_id),
            user_id: Set(self.actor_id),
            action: Set(self.action.as_str().to_string()),
            entity_name: Set(self.entity_name),
            entity_id: Set(self.entity_id),
            old_values: Set(self.old_value),
            new_values: Set(self.new_value),
            ip_address: Set(self.source_ip),
            user_agent: Set(self.user_agent),
            created_at: Set(self.created_at.into()),
            ..Default::default()
        }
    }
}

/// Destination for audit entries.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn write(&self, entry: AuditEntry) -> Result<(), sea_orm::DbErr>;
}

/// Inserts straight into `audit_logs`, outside any audited store.
pub struct DatabaseSink {
    db: Arc<DatabaseConnection>,
}

impl DatabaseSink {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl AuditSink for DatabaseSink {
    async fn write(&self, entry: AuditEntry) -> Result<(), sea_orm::DbErr> {
        audit_logs::Entity::insert(entry.into_active_model())
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Recorder {
    sink: Arc<dyn AuditSink>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn with_database(db: Arc<DatabaseConnection>) -> Self {
        Self::new(Arc::new(DatabaseSink::new(db)))
    }

    /// Records a completed create; `entity` is the row as stored.
    pub async fn created<T: Serialize + ?Sized>(
        &self,
        ctx: &AuditContext,
        meta: &EntityMeta,
        entity: &T,
    ) {
        self.emit(AuditEntry::capture(ctx, meta, AuditAction::Create, None, Some(entity)))
            .await;
    }

    /// Records an update about to be written; `entity` is the new state.
    pub async fn updated<T: Serialize + ?Sized>(
        &self,
        ctx: &AuditContext,
        meta: &EntityMeta,
        entity: &T,
    ) {
        self.emit(AuditEntry::capture(ctx, meta, AuditAction::Update, None, Some(entity)))
            .await;
    }

    /// Records a delete about to be written; `target` is what gets removed.
    pub async fn deleted<T: Serialize + ?Sized>(
        &self,
        ctx: &AuditContext,
        meta: &EntityMeta,
        target: &T,
    ) {
        self.emit(AuditEntry::capture(ctx, meta, AuditAction::Delete, Some(target), None))
            .await;
    }

    // The write runs on its own task: dropping the caller's future (client
    // disconnect, timeout) does not cancel it.
    async fn emit(&self, entry: Option<AuditEntry>) {
        let Some(entry) = entry else {
            return;
        };

        let action = entry.action;
        let entity = entry.entity_name.clone();
        let entity_id = entry.entity_id;

        let sink = self.sink.clone();
        let write = tokio::spawn(async move { sink.write(entry).await });

        match write.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(%err, %action, %entity, entity_id, "failed to write audit log");
            }
            Err(err) => {
                tracing::warn!(%err, %action, %entity, entity_id, "audit log task did not complete");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use medscreen_db::entities::patients;
    use serde_json::json;

    use super::testing::{FailingSink, MemorySink};
    use super::*;

    #[derive(Serialize)]
    struct Patient {
        id: i64,
        name: String,
    }

    #[derive(Serialize)]
    struct Appointment {
        id: i64,
    }

    #[derive(Serialize)]
    struct Note {
        body: String,
    }

    fn ctx() -> AuditContext {
        AuditContext {
            actor_id: Some(3),
            request_id: "req-1".to_string(),
            source_ip: "10.0.0.5".to_string(),
            user_agent: "curl/8.5".to_string(),
        }
    }

    #[test]
    fn create_captures_stored_state() {
        let meta = EntityMeta::new("Patient", &["id"]);
        let stored = Patient {
            id: 42,
            name: "Jane Doe".to_string(),
        };

        let entry =
            AuditEntry::capture(&ctx(), &meta, AuditAction::Create, None, Some(&stored)).unwrap();

        assert_eq!(entry.action, AuditAction::Create);
        assert_eq!(entry.entity_name, "Patient");
        assert_eq!(entry.entity_id, 42);
        assert_eq!(entry.old_value, "");
        assert_eq!(entry.new_value, r#"{"id":42,"name":"Jane Doe"}"#);
        assert_eq!(entry.actor_id, Some(3));
        assert_eq!(entry.source_ip, "10.0.0.5");
        assert_eq!(entry.user_agent, "curl/8.5");
        assert_eq!(entry.request_id, "req-1");
    }

    #[test]
    fn delete_captures_target_as_old_value() {
        let meta = EntityMeta::new("Appointment", &["id"]);
        let target = Appointment { id: 7 };

        let entry =
            AuditEntry::capture(&ctx(), &meta, AuditAction::Delete, Some(&target), None).unwrap();

        assert_eq!(entry.action, AuditAction::Delete);
        assert_eq!(entry.entity_name, "Appointment");
        assert_eq!(entry.entity_id, 7);
        assert_eq!(entry.old_value, r#"{"id":7}"#);
        assert_eq!(entry.new_value, "");
    }

    #[test]
    fn update_leaves_old_value_empty() {
        let meta = EntityMeta::new("Patient", &["id"]);
        let edited = Patient {
            id: 5,
            name: "John Roe".to_string(),
        };

        let entry =
            AuditEntry::capture(&ctx(), &meta, AuditAction::Update, None, Some(&edited)).unwrap();

        assert_eq!(entry.entity_id, 5);
        assert_eq!(entry.old_value, "");
        assert_eq!(entry.new_value, r#"{"id":5,"name":"John Roe"}"#);
    }

    #[test]
    fn audit_table_is_never_captured() {
        let meta = EntityMeta::of::<audit_logs::Entity>();
        let row = json!({ "id": 1, "action": "CREATE" });

        assert!(meta.is_audit_table());
        assert!(AuditEntry::capture(&ctx(), &meta, AuditAction::Create, None, Some(&row)).is_none());
        assert!(AuditEntry::capture(&ctx(), &meta, AuditAction::Delete, Some(&row), None).is_none());
    }

    #[test]
    fn missing_primary_key_resolves_to_zero() {
        let meta = EntityMeta::new("notes", &[]);
        let note = Note {
            body: "ward round".to_string(),
        };

        let entry =
            AuditEntry::capture(&ctx(), &meta, AuditAction::Create, None, Some(&note)).unwrap();

        assert_eq!(entry.entity_id, 0);
        assert_eq!(entry.new_value, r#"{"body":"ward round"}"#);
    }

    #[test]
    fn resolution_walks_declared_fields_then_falls_back_to_id() {
        let meta = EntityMeta::new("visits", &["visit_no", "legacy_no"]);
        assert_eq!(meta.resolve_entity_id(&json!({ "visit_no": 0, "legacy_no": 9 })), 9);
        assert_eq!(meta.resolve_entity_id(&json!({ "visit_no": 0, "id": 4 })), 4);
        assert_eq!(meta.resolve_entity_id(&json!({ "visit_no": "abc" })), 0);
        assert_eq!(meta.resolve_entity_id(&json!([1, 2])), 0);

        let no_meta = EntityMeta::new("visits", &[]);
        assert_eq!(no_meta.resolve_entity_id(&json!({ "id": 11 })), 11);
    }

    #[test]
    fn entity_meta_reads_sea_orm_metadata() {
        let meta = EntityMeta::of::<patients::Entity>();
        assert_eq!(meta.name(), "patients");
        assert_eq!(meta.primary_key(), ["id".to_string()]);
        assert!(!meta.is_audit_table());
    }

    #[test]
    fn unserializable_value_is_recorded_empty() {
        use std::collections::HashMap;

        // Non-string map keys cannot be encoded as JSON objects.
        let mut odd = HashMap::new();
        odd.insert((1, 2), "x");
        let meta = EntityMeta::new("odd", &["id"]);

        let entry =
            AuditEntry::capture(&ctx(), &meta, AuditAction::Update, None, Some(&odd)).unwrap();

        assert_eq!(entry.new_value, "");
        assert_eq!(entry.entity_id, 0);
    }

    #[tokio::test]
    async fn recorder_writes_one_entry_per_operation() {
        let sink = Arc::new(MemorySink::default());
        let recorder = Recorder::new(sink.clone());
        let meta = EntityMeta::new("Appointment", &["id"]);

        let before = chrono::Utc::now();
        recorder.created(&ctx(), &meta, &Appointment { id: 1 }).await;
        recorder.updated(&ctx(), &meta, &Appointment { id: 1 }).await;
        recorder.deleted(&ctx(), &meta, &Appointment { id: 1 }).await;
        let after = chrono::Utc::now();

        let entries = sink.entries();
        let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            [AuditAction::Create, AuditAction::Update, AuditAction::Delete]
        );
        assert!(
            entries
                .iter()
                .all(|e| e.created_at >= before && e.created_at <= after)
        );
    }

    #[tokio::test]
    async fn failing_sink_is_swallowed() {
        let recorder = Recorder::new(Arc::new(FailingSink));
        let meta = EntityMeta::new("Patient", &["id"]);

        recorder
            .created(
                &ctx(),
                &meta,
                &Patient {
                    id: 1,
                    name: "A".to_string(),
                },
            )
            .await;
    }

    struct SlowSink {
        delay: std::time::Duration,
        inner: MemorySink,
    }

    #[async_trait::async_trait]
    impl AuditSink for SlowSink {
        async fn write(&self, entry: AuditEntry) -> Result<(), sea_orm::DbErr> {
            tokio::time::sleep(self.delay).await;
            self.inner.write(entry).await
        }
    }

    #[tokio::test]
    async fn write_survives_caller_timeout() {
        let sink = Arc::new(SlowSink {
            delay: std::time::Duration::from_millis(50),
            inner: MemorySink::default(),
        });
        let recorder = Recorder::new(sink.clone());
        let meta = EntityMeta::new("Appointment", &["id"]);

        let caller = tokio::time::timeout(
            std::time::Duration::from_millis(5),
            recorder.created(&ctx(), &meta, &Appointment { id: 3 }),
        )
        .await;
        assert!(caller.is_err(), "caller should have given up first");
        assert!(sink.inner.entries().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let entries = sink.inner.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, 3);
    }

    #[test]
    fn snapshot_text_and_id_agree() {
        let meta = EntityMeta::new("Patient", &["id"]);
        let snap = Snapshot::take(&Patient {
            id: 12,
            name: "Ada".to_string(),
        });
        assert_eq!(snap.text, r#"{"id":12,"name":"Ada"}"#);
        assert_eq!(snap.entity_id(&meta), 12);
    }

    // A sink that tries to audit its own insert, the way an ORM hook on the
    // audit table would.
    struct ReentrantSink {
        writes: AtomicUsize,
        recorder: OnceLock<Recorder>,
    }

    #[async_trait::async_trait]
    impl AuditSink for ReentrantSink {
        async fn write(&self, entry: AuditEntry) -> Result<(), sea_orm::DbErr> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(recorder) = self.recorder.get() {
                let row = json!({ "id": 1, "action": entry.action.as_str() });
                recorder
                    .created(&AuditContext::system(), &EntityMeta::of::<audit_logs::Entity>(), &row)
                    .await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn audit_write_does_not_recurse() {
        let sink = Arc::new(ReentrantSink {
            writes: AtomicUsize::new(0),
            recorder: OnceLock::new(),
        });
        let recorder = Recorder::new(sink.clone());
        let _ = sink.recorder.set(recorder.clone());

        recorder
            .deleted(&ctx(), &EntityMeta::new("Appointment", &["id"]), &Appointment { id: 7 })
            .await;

        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
    }
}
