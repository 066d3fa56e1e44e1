//! Change-feed consumer: row mutations of one table, mapped to a typed row.
//!
//! Delivery is at-least-once. The consumer does not deduplicate; callers keep
//! rows in a [`LiveRows`] (upsert by id, optional version gate) or apply the
//! same idempotent logic themselves.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;

use crate::channel::OnEvent;
use crate::context::RealtimeContext;
use crate::coordinator::{CoordinatorConfig, HideBehavior, LifecycleCoordinator};
use crate::error::Result;
use crate::event_handlers::LifecycleHandlers;
use crate::models::{
    ChangeOp, ChannelSpec, ConnectionStatus, Event, FilterSpec, LiveRow, NotificationRow,
    ProjectRow, UserIdentity,
};
use crate::reconnect::ReconnectPolicy;

/// Placeholder replaced with the signed-in user's id in filter templates.
pub const USER_ID_PLACEHOLDER: &str = "{user_id}";

/// What a change-feed consumer subscribes to.
#[derive(Debug, Clone)]
pub struct ChangeFeedOptions {
    /// Logical channel name; defaults to the table name
    pub name: String,
    pub schema: String,
    pub table: String,
    /// Only this operation, or every operation when `None`
    pub op: Option<ChangeOp>,
    /// Server-side filter such as `user_id=eq.{user_id}`
    pub filter_template: Option<String>,
    /// Overrides the context's change-feed policy
    pub policy: Option<ReconnectPolicy>,
    pub hide_behavior: HideBehavior,
    pub handlers: LifecycleHandlers,
}

impl ChangeFeedOptions {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            name: table.clone(),
            schema: "public".to_string(),
            table,
            op: None,
            filter_template: None,
            policy: None,
            hide_behavior: HideBehavior::StayActive,
            handlers: LifecycleHandlers::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn op(mut self, op: ChangeOp) -> Self {
        self.op = Some(op);
        self
    }

    pub fn filter_template(mut self, template: impl Into<String>) -> Self {
        self.filter_template = Some(template.into());
        self
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn hide_behavior(mut self, hide_behavior: HideBehavior) -> Self {
        self.hide_behavior = hide_behavior;
        self
    }

    pub fn handlers(mut self, handlers: LifecycleHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Channel spec for `user`. The topic carries the user id whenever the
    /// filter is user-specific so two users never share a topic.
    pub fn spec_for(&self, user: &UserIdentity) -> ChannelSpec {
        let mut filter = FilterSpec::rows(self.table.clone()).with_schema(self.schema.clone());
        if let Some(op) = self.op {
            filter = filter.with_op(op);
        }
        let topic = match &self.filter_template {
            Some(template) => {
                filter = filter.with_filter(template.replace(USER_ID_PLACEHOLDER, &user.user_id));
                if template.contains(USER_ID_PLACEHOLDER) {
                    format!("{}:{}", self.name, user.user_id)
                } else {
                    self.name.clone()
                }
            },
            None => self.name.clone(),
        };
        ChannelSpec::new(topic, vec![filter])
    }
}

/// Typed row-change subscription for one table.
///
/// Dropping the consumer unmounts it.
pub struct ChangeFeedConsumer<T> {
    coordinator: LifecycleCoordinator,
    _row: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for ChangeFeedConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedConsumer")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// Decode a wire row into the consumer's row shape.
pub fn map_row<T: DeserializeOwned>(row: Map<String, JsonValue>) -> Result<T> {
    Ok(serde_json::from_value(JsonValue::Object(row))?)
}

impl<T> ChangeFeedConsumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Subscribe and invoke `on_change(op, row)` for every mutation.
    ///
    /// Rows that do not fit `T` are dropped with a warning.
    pub fn mount(
        ctx: &RealtimeContext,
        options: ChangeFeedOptions,
        on_change: impl Fn(ChangeOp, T) + Send + Sync + 'static,
    ) -> Result<Self> {
        let table = options.table.clone();
        let on_event: OnEvent = Arc::new(move |event| {
            let Event::RowChanged { table: event_table, op, row } = event else {
                return;
            };
            if event_table != table {
                return;
            }
            match map_row::<T>(row) {
                Ok(typed) => on_change(op, typed),
                Err(e) => log::warn!(
                    "[realtime-sync] Dropping {} row for '{}': {}",
                    op,
                    table,
                    e
                ),
            }
        });

        let policy = options
            .policy
            .clone()
            .unwrap_or_else(|| ctx.policies().change_feed.clone());
        let spec_options = options.clone();
        let config = CoordinatorConfig::new(options.name.clone(), move |user| {
            spec_options.spec_for(user)
        })
        .with_policy(policy)
        .with_hide_behavior(options.hide_behavior)
        .with_handlers(options.handlers);

        Ok(Self {
            coordinator: LifecycleCoordinator::mount(ctx, config, on_event)?,
            _row: PhantomData,
        })
    }
}

impl ChangeFeedConsumer<NotificationRow> {
    /// New notifications for the signed-in user.
    pub fn notifications(
        ctx: &RealtimeContext,
        on_new_notification: impl Fn(NotificationRow) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::notifications_with(ctx, LifecycleHandlers::default(), on_new_notification)
    }

    pub fn notifications_with(
        ctx: &RealtimeContext,
        handlers: LifecycleHandlers,
        on_new_notification: impl Fn(NotificationRow) + Send + Sync + 'static,
    ) -> Result<Self> {
        let options = ChangeFeedOptions::new("notifications")
            .op(ChangeOp::Insert)
            .filter_template("user_id=eq.{user_id}")
            .handlers(handlers);
        Self::mount(ctx, options, move |_, row| on_new_notification(row))
    }
}

impl ChangeFeedConsumer<ProjectRow> {
    /// Every project mutation, reported as `(op, project id)`.
    pub fn projects(
        ctx: &RealtimeContext,
        on_project_change: impl Fn(ChangeOp, String) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::mount(ctx, ChangeFeedOptions::new("projects"), move |op, row: ProjectRow| {
            on_project_change(op, row.id)
        })
    }
}

impl<T> ChangeFeedConsumer<T> {
    pub fn status(&self) -> ConnectionStatus {
        self.coordinator.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.coordinator.subscribe_status()
    }

    /// Manual refresh: resubscribe now if degraded or backing off.
    pub fn wake(&self) {
        self.coordinator.wake();
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    /// Unmount. Idempotent.
    pub fn close(&self) {
        self.coordinator.close();
    }
}

// ── UI-side row store ───────────────────────────────────────────────────────

/// Deleted ids remembered with the version gate on. Past this the oldest
/// deletions are forgotten.
const MAX_TOMBSTONES: usize = 1024;

/// Rows kept in display order (newest first), upserted by id.
///
/// With the version gate on, a redelivered or out-of-order event whose
/// [`LiveRow::row_version`] is older than the stored row is ignored, and a
/// deleted row is not resurrected by an older insert.
#[derive(Debug, Clone)]
pub struct LiveRows<T> {
    rows: Vec<T>,
    version_gate: bool,
    /// Versions of deleted rows (gate on only)
    tombstones: HashMap<String, i64>,
}

impl<T: LiveRow> Default for LiveRows<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: LiveRow> LiveRows<T> {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            version_gate: false,
            tombstones: HashMap::new(),
        }
    }

    pub fn with_version_gate() -> Self {
        Self {
            version_gate: true,
            ..Self::new()
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|row| row.row_id() == id)
    }

    fn is_stale(&self, current: Option<i64>, incoming: Option<i64>) -> bool {
        match (self.version_gate, current, incoming) {
            (true, Some(current), Some(incoming)) => incoming < current,
            _ => false,
        }
    }

    /// Apply one change. Returns true when the visible rows changed.
    pub fn apply(&mut self, op: ChangeOp, row: T) -> bool {
        match op {
            ChangeOp::Insert | ChangeOp::Update => self.upsert(row),
            ChangeOp::Delete => self.remove(row),
        }
    }

    fn upsert(&mut self, row: T) -> bool {
        let incoming = row.row_version();
        if let Some(index) = self.position(row.row_id()) {
            if self.is_stale(self.rows[index].row_version(), incoming) {
                return false;
            }
            self.rows[index] = row;
            return true;
        }

        if self.version_gate {
            let deleted_at = self.tombstones.get(row.row_id()).copied();
            if let (Some(deleted_at), Some(incoming)) = (deleted_at, incoming) {
                if incoming <= deleted_at {
                    return false;
                }
            }
            self.tombstones.remove(row.row_id());
        }
        self.rows.insert(0, row);
        true
    }

    fn remove(&mut self, row: T) -> bool {
        let Some(index) = self.position(row.row_id()) else {
            return false;
        };
        if self.is_stale(self.rows[index].row_version(), row.row_version()) {
            return false;
        }
        let removed = self.rows.remove(index);
        if self.version_gate {
            if let Some(version) = row.row_version().or(removed.row_version()) {
                self.tombstones.insert(removed.row_id().to_string(), version);
                self.prune_tombstones();
            }
        }
        true
    }

    fn prune_tombstones(&mut self) {
        while self.tombstones.len() > MAX_TOMBSTONES {
            let oldest = self
                .tombstones
                .iter()
                .min_by_key(|(_, version)| **version)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => self.tombstones.remove(&id),
                None => break,
            };
        }
    }

    /// Replace everything after a refetch.
    pub fn replace_all(&mut self, rows: Vec<T>) {
        self.rows = rows;
        self.tombstones.clear();
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.rows.iter().find(|row| row.row_id() == id)
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn notification(id: &str, title: &str, minute: u32) -> NotificationRow {
        NotificationRow {
            id: id.to_string(),
            user_id: "u1".to_string(),
            title: title.to_string(),
            message: None,
            link: None,
            is_read: false,
            created_at: Some(Utc.with_ymd_and_hms(2026, 10, 18, 9, minute, 0).unwrap()),
        }
    }

    #[test]
    fn test_spec_binds_user_id() {
        let options = ChangeFeedOptions::new("notifications")
            .op(ChangeOp::Insert)
            .filter_template("user_id=eq.{user_id}");
        let spec = options.spec_for(&UserIdentity::new("u42", "Ada"));

        assert_eq!(spec.topic, "notifications:u42");
        assert!(!spec.receive_own_broadcasts);
        assert_eq!(
            spec.filters,
            vec![FilterSpec::rows("notifications")
                .with_op(ChangeOp::Insert)
                .with_filter("user_id=eq.u42")]
        );

        let shared = ChangeFeedOptions::new("projects").spec_for(&UserIdentity::new("u1", "A"));
        assert_eq!(shared.topic, "projects");
    }

    #[test]
    fn test_map_row() {
        let mut row = Map::new();
        row.insert("id".into(), serde_json::json!("n1"));
        row.insert("user_id".into(), serde_json::json!("u1"));
        row.insert("title".into(), serde_json::json!("Leave approved"));
        let typed: NotificationRow = map_row(row).unwrap();
        assert_eq!(typed.title, "Leave approved");
        assert!(!typed.is_read);

        let mut bad = Map::new();
        bad.insert("id".into(), serde_json::json!(5));
        assert!(map_row::<NotificationRow>(bad).is_err());
    }

    #[test]
    fn test_upsert_by_id_tolerates_redelivery() {
        let mut rows = LiveRows::new();
        assert!(rows.apply(ChangeOp::Insert, notification("n1", "First", 0)));
        assert!(rows.apply(ChangeOp::Insert, notification("n2", "Second", 1)));
        assert!(rows.apply(ChangeOp::Insert, notification("n1", "First", 0)));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows()[0].id, "n2");
        assert!(rows.apply(ChangeOp::Delete, notification("n1", "First", 0)));
        assert!(!rows.apply(ChangeOp::Delete, notification("n1", "First", 0)));
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_version_gate_rejects_out_of_order() {
        let mut rows = LiveRows::with_version_gate();
        rows.apply(ChangeOp::Insert, notification("n1", "v2", 5));
        assert!(!rows.apply(ChangeOp::Update, notification("n1", "v1", 1)));
        assert_eq!(rows.get("n1").unwrap().title, "v2");
        assert!(rows.apply(ChangeOp::Update, notification("n1", "v3", 9)));

        assert!(rows.apply(ChangeOp::Delete, notification("n1", "v3", 9)));
        assert!(!rows.apply(ChangeOp::Insert, notification("n1", "v3", 9)));
        assert!(rows.is_empty());
        assert!(rows.apply(ChangeOp::Insert, notification("n1", "v4", 10)));

        let mut ungated = LiveRows::new();
        ungated.apply(ChangeOp::Insert, notification("n1", "v2", 5));
        assert!(ungated.apply(ChangeOp::Update, notification("n1", "v1", 1)));
        assert_eq!(ungated.get("n1").unwrap().title, "v1");
    }

    #[test]
    fn test_tombstones_are_pruned() {
        let mut rows = LiveRows::with_version_gate();
        rows.apply(ChangeOp::Insert, notification("n1", "v1", 1));
        rows.apply(ChangeOp::Delete, notification("n1", "v1", 2));
        assert_eq!(rows.tombstones.len(), 1);
        assert!(rows.apply(ChangeOp::Insert, notification("n1", "v2", 3)));
        assert!(rows.tombstones.is_empty());

        let versioned = |i: usize| NotificationRow {
            created_at: Utc.timestamp_opt(1_800_000_000 + i as i64, 0).single(),
            ..notification(&format!("bulk{}", i), "bulk", 0)
        };
        let total = MAX_TOMBSTONES + 10;
        for i in 0..total {
            rows.apply(ChangeOp::Insert, versioned(i));
            rows.apply(ChangeOp::Delete, versioned(i));
        }
        assert_eq!(rows.tombstones.len(), MAX_TOMBSTONES);
        assert!(!rows.tombstones.contains_key("bulk0"));
        assert!(rows.tombstones.contains_key(&format!("bulk{}", total - 1)));
        assert!(!rows.apply(ChangeOp::Insert, versioned(total - 1)));
    }
}
