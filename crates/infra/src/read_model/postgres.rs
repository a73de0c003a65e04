//! Postgres-backed read model.
//!
//! Entities, edges, external links and timeline entries live in four JSONB-backed
//! tables. Every key starts with the tenant, so no query can cross tenants.
//!
//! `merge` locks the row (`SELECT .. FOR UPDATE`) and applies the same
//! [`EntityRecord::apply_merge`] rules as the in-memory store before writing it back,
//! so both backends agree on field precedence.
//!
//! Like [`PostgresEventStore`](crate::event_store::PostgresEventStore), the sync trait
//! blocks on a runtime handle and must not be called from that runtime's own tasks.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use custos_core::{EntityId, ExternalSystem, TenantId};

use super::model::{ActionEntry, EntityMerge, EntityRecord, MergeOutcome, NodeRef, RelatedItem, Relation};
use super::store::{ReadModelError, ReadModelStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rm_entities (
        tenant TEXT NOT NULL,
        label TEXT NOT NULL,
        id UUID NOT NULL,
        fields JSONB NOT NULL DEFAULT '{}'::jsonb,
        source_of_truth TEXT NOT NULL DEFAULT '',
        placeholder BOOLEAN NOT NULL DEFAULT FALSE,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant, label, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rm_relations (
        tenant TEXT NOT NULL,
        from_label TEXT NOT NULL,
        from_id UUID NOT NULL,
        kind TEXT NOT NULL,
        to_label TEXT NOT NULL,
        to_id UUID NOT NULL,
        properties JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (tenant, from_label, from_id, kind, to_label, to_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rm_external_links (
        tenant TEXT NOT NULL,
        label TEXT NOT NULL,
        id UUID NOT NULL,
        external_system_id TEXT NOT NULL,
        external_id TEXT NOT NULL,
        link JSONB NOT NULL,
        PRIMARY KEY (tenant, label, id, external_system_id, external_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rm_actions (
        tenant TEXT NOT NULL,
        label TEXT NOT NULL,
        id UUID NOT NULL,
        action_id UUID NOT NULL,
        action JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant, label, id, action_id)
    )
    "#,
];

const ENTITY_COLUMNS: &str = "label, id, fields, source_of_truth, placeholder, deleted, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresReadModel {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresReadModel {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub async fn migrate(&self) -> Result<(), ReadModelError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("migrate", e))?;
        }
        Ok(())
    }

    fn run<T>(&self, fut: impl Future<Output = Result<T, ReadModelError>>) -> Result<T, ReadModelError> {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, merge), fields(tenant = %tenant, label = %merge.label, id = %merge.id), err)]
    pub async fn merge_async(&self, tenant: &TenantId, merge: EntityMerge) -> Result<MergeOutcome, ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("begin", e))?;
        let node = merge.node();

        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM rm_entities WHERE tenant = $1 AND label = $2 AND id = $3 FOR UPDATE"
        ))
        .bind(tenant.as_str())
        .bind(&node.label)
        .bind(node.id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| backend("select_entity", e))?;

        let before = row.as_ref().map(record_from_row).transpose()?;
        let created = before.is_none();
        let now = Utc::now();
        let mut record = before
            .clone()
            .unwrap_or_else(|| EntityRecord::new(merge.label.clone(), merge.id, now));
        let changed = record.apply_merge(&merge, created, now);

        upsert_record(&mut tx, tenant, &record).await?;
        tx.commit().await.map_err(|e| backend("commit", e))?;

        Ok(MergeOutcome {
            created,
            changed,
            before,
        })
    }

    async fn ensure_async(&self, tenant: &TenantId, node: &NodeRef) -> Result<bool, ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("begin", e))?;
        let created = ensure_in(&mut tx, tenant, node).await?;
        tx.commit().await.map_err(|e| backend("commit", e))?;
        Ok(created)
    }

    async fn get_async(&self, tenant: &TenantId, node: &NodeRef) -> Result<Option<EntityRecord>, ReadModelError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM rm_entities WHERE tenant = $1 AND label = $2 AND id = $3"
        ))
        .bind(tenant.as_str())
        .bind(&node.label)
        .bind(node.id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("get_entity", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_async(&self, tenant: &TenantId, label: &str) -> Result<Vec<EntityRecord>, ReadModelError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM rm_entities WHERE tenant = $1 AND label = $2 ORDER BY id"
        ))
        .bind(tenant.as_str())
        .bind(label)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("list_entities", e))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn relate_async(&self, tenant: &TenantId, relation: Relation) -> Result<(), ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("begin", e))?;
        ensure_in(&mut tx, tenant, &relation.from).await?;
        ensure_in(&mut tx, tenant, &relation.to).await?;
        insert_relation(&mut tx, tenant, &relation).await?;
        tx.commit().await.map_err(|e| backend("commit", e))
    }

    async fn unrelate_async(
        &self,
        tenant: &TenantId,
        from: &NodeRef,
        kind: &str,
        to: &NodeRef,
    ) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            DELETE FROM rm_relations
            WHERE tenant = $1 AND from_label = $2 AND from_id = $3 AND kind = $4 AND to_label = $5 AND to_id = $6
            "#,
        )
        .bind(tenant.as_str())
        .bind(&from.label)
        .bind(from.id.as_uuid())
        .bind(kind)
        .bind(&to.label)
        .bind(to.id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| backend("unrelate", e))?;
        Ok(())
    }

    async fn edges_async(
        &self,
        tenant: &TenantId,
        kind: &str,
        node: &NodeRef,
        outgoing: bool,
    ) -> Result<Vec<Relation>, ReadModelError> {
        let filter = if outgoing {
            "from_label = $3 AND from_id = $4"
        } else {
            "to_label = $3 AND to_id = $4"
        };
        let rows = sqlx::query(&format!(
            "SELECT from_label, from_id, kind, to_label, to_id, properties FROM rm_relations \
             WHERE tenant = $1 AND kind = $2 AND {filter}"
        ))
        .bind(tenant.as_str())
        .bind(kind)
        .bind(&node.label)
        .bind(node.id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("select_relations", e))?;
        rows.iter().map(relation_from_row).collect()
    }

    async fn link_external_async(
        &self,
        tenant: &TenantId,
        node: &NodeRef,
        link: &ExternalSystem,
    ) -> Result<(), ReadModelError> {
        let payload = serde_json::to_value(link).map_err(|e| ReadModelError::Backend(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(|e| backend("begin", e))?;
        ensure_in(&mut tx, tenant, node).await?;
        sqlx::query(
            r#"
            INSERT INTO rm_external_links (tenant, label, id, external_system_id, external_id, link)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant, label, id, external_system_id, external_id)
            DO UPDATE SET link = EXCLUDED.link
            "#,
        )
        .bind(tenant.as_str())
        .bind(&node.label)
        .bind(node.id.as_uuid())
        .bind(&link.external_system_id)
        .bind(&link.external_id)
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("link_external", e))?;
        tx.commit().await.map_err(|e| backend("commit", e))
    }

    async fn external_links_async(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ExternalSystem>, ReadModelError> {
        let rows = sqlx::query("SELECT link FROM rm_external_links WHERE tenant = $1 AND label = $2 AND id = $3")
            .bind(tenant.as_str())
            .bind(&node.label)
            .bind(node.id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("external_links", e))?;
        rows.iter()
            .map(|row| {
                let link: Value = row.try_get("link").map_err(|e| backend("decode_link", e))?;
                serde_json::from_value(link).map_err(|e| malformed(node, e))
            })
            .collect()
    }

    #[instrument(skip(self, items), fields(tenant = %tenant, owner = %owner.id, kind, items = items.len()), err)]
    async fn replace_related_async(
        &self,
        tenant: &TenantId,
        owner: &NodeRef,
        kind: &str,
        items: Vec<RelatedItem>,
    ) -> Result<(), ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("begin", e))?;
        ensure_in(&mut tx, tenant, owner).await?;

        let keep: Vec<Uuid> = items.iter().map(|i| *i.id.as_uuid()).collect();
        let stale = sqlx::query(
            r#"
            SELECT to_label, to_id FROM rm_relations
            WHERE tenant = $1 AND from_label = $2 AND from_id = $3 AND kind = $4 AND NOT (to_id = ANY($5))
            "#,
        )
        .bind(tenant.as_str())
        .bind(&owner.label)
        .bind(owner.id.as_uuid())
        .bind(kind)
        .bind(&keep)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| backend("select_stale", e))?;
        for row in &stale {
            let label: String = row.try_get("to_label").map_err(|e| backend("decode_stale", e))?;
            let id: Uuid = row.try_get("to_id").map_err(|e| backend("decode_stale", e))?;
            remove_in(&mut tx, tenant, &NodeRef::new(label, EntityId::from_uuid(id))).await?;
        }

        let now = Utc::now();
        for item in items {
            let node = NodeRef::new(item.label.clone(), item.id);
            sqlx::query(
                r#"
                INSERT INTO rm_entities (tenant, label, id, fields, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $5)
                ON CONFLICT (tenant, label, id)
                DO UPDATE SET fields = rm_entities.fields || EXCLUDED.fields,
                              placeholder = FALSE,
                              updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(tenant.as_str())
            .bind(&node.label)
            .bind(node.id.as_uuid())
            .bind(Value::Object(item.fields))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("upsert_item", e))?;
            insert_relation(&mut tx, tenant, &Relation::new(owner.clone(), kind, node)).await?;
        }

        tx.commit().await.map_err(|e| backend("commit", e))
    }

    async fn soft_delete_async(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            UPDATE rm_entities SET deleted = TRUE, updated_at = now()
            WHERE tenant = $1 AND label = $2 AND id = $3 AND NOT deleted
            "#,
        )
        .bind(tenant.as_str())
        .bind(&node.label)
        .bind(node.id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| backend("soft_delete", e))?;
        Ok(())
    }

    async fn delete_async(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("begin", e))?;
        remove_in(&mut tx, tenant, node).await?;
        tx.commit().await.map_err(|e| backend("commit", e))
    }

    async fn append_action_async(&self, tenant: &TenantId, action: ActionEntry) -> Result<bool, ReadModelError> {
        let payload = serde_json::to_value(&action).map_err(|e| ReadModelError::Backend(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO rm_actions (tenant, label, id, action_id, action, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tenant.as_str())
        .bind(&action.entity.label)
        .bind(action.entity.id.as_uuid())
        .bind(action.id)
        .bind(payload)
        .bind(action.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("append_action", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn actions_for_async(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ActionEntry>, ReadModelError> {
        let rows = sqlx::query(
            "SELECT action FROM rm_actions WHERE tenant = $1 AND label = $2 AND id = $3 ORDER BY created_at",
        )
        .bind(tenant.as_str())
        .bind(&node.label)
        .bind(node.id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("actions_for", e))?;
        rows.iter()
            .map(|row| {
                let action: Value = row.try_get("action").map_err(|e| backend("decode_action", e))?;
                serde_json::from_value(action).map_err(|e| malformed(node, e))
            })
            .collect()
    }
}

impl ReadModelStore for PostgresReadModel {
    fn merge(&self, tenant: &TenantId, merge: EntityMerge) -> Result<MergeOutcome, ReadModelError> {
        self.run(self.merge_async(tenant, merge))
    }

    fn ensure_placeholder(&self, tenant: &TenantId, node: &NodeRef) -> Result<bool, ReadModelError> {
        self.run(self.ensure_async(tenant, node))
    }

    fn get(&self, tenant: &TenantId, node: &NodeRef) -> Result<Option<EntityRecord>, ReadModelError> {
        self.run(self.get_async(tenant, node))
    }

    fn list(&self, tenant: &TenantId, label: &str) -> Result<Vec<EntityRecord>, ReadModelError> {
        self.run(self.list_async(tenant, label))
    }

    fn relate(&self, tenant: &TenantId, relation: Relation) -> Result<(), ReadModelError> {
        self.run(self.relate_async(tenant, relation))
    }

    fn unrelate(&self, tenant: &TenantId, from: &NodeRef, kind: &str, to: &NodeRef) -> Result<(), ReadModelError> {
        self.run(self.unrelate_async(tenant, from, kind, to))
    }

    fn related(&self, tenant: &TenantId, from: &NodeRef, kind: &str) -> Result<Vec<Relation>, ReadModelError> {
        self.run(self.edges_async(tenant, kind, from, true))
    }

    fn related_from(&self, tenant: &TenantId, kind: &str, to: &NodeRef) -> Result<Vec<Relation>, ReadModelError> {
        self.run(self.edges_async(tenant, kind, to, false))
    }

    fn link_external(&self, tenant: &TenantId, node: &NodeRef, link: &ExternalSystem) -> Result<(), ReadModelError> {
        self.run(self.link_external_async(tenant, node, link))
    }

    fn external_links(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ExternalSystem>, ReadModelError> {
        self.run(self.external_links_async(tenant, node))
    }

    fn replace_related(
        &self,
        tenant: &TenantId,
        owner: &NodeRef,
        kind: &str,
        items: Vec<RelatedItem>,
    ) -> Result<(), ReadModelError> {
        self.run(self.replace_related_async(tenant, owner, kind, items))
    }

    fn soft_delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        self.run(self.soft_delete_async(tenant, node))
    }

    fn delete(&self, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
        self.run(self.delete_async(tenant, node))
    }

    fn append_action(&self, tenant: &TenantId, action: ActionEntry) -> Result<bool, ReadModelError> {
        self.run(self.append_action_async(tenant, action))
    }

    fn actions_for(&self, tenant: &TenantId, node: &NodeRef) -> Result<Vec<ActionEntry>, ReadModelError> {
        self.run(self.actions_for_async(tenant, node))
    }
}

async fn ensure_in(tx: &mut Transaction<'_, Postgres>, tenant: &TenantId, node: &NodeRef) -> Result<bool, ReadModelError> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO rm_entities (tenant, label, id, placeholder, created_at, updated_at)
        VALUES ($1, $2, $3, TRUE, $4, $4)
        ON CONFLICT (tenant, label, id) DO NOTHING
        "#,
    )
    .bind(tenant.as_str())
    .bind(&node.label)
    .bind(node.id.as_uuid())
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| backend("ensure_placeholder", e))?;
    Ok(result.rows_affected() == 1)
}

async fn remove_in(tx: &mut Transaction<'_, Postgres>, tenant: &TenantId, node: &NodeRef) -> Result<(), ReadModelError> {
    let statements = [
        "DELETE FROM rm_entities WHERE tenant = $1 AND label = $2 AND id = $3",
        "DELETE FROM rm_relations WHERE tenant = $1 AND ((from_label = $2 AND from_id = $3) OR (to_label = $2 AND to_id = $3))",
        "DELETE FROM rm_external_links WHERE tenant = $1 AND label = $2 AND id = $3",
    ];
    for statement in statements {
        sqlx::query(statement)
            .bind(tenant.as_str())
            .bind(&node.label)
            .bind(node.id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| backend("delete_entity", e))?;
    }
    Ok(())
}

async fn upsert_record(
    tx: &mut Transaction<'_, Postgres>,
    tenant: &TenantId,
    record: &EntityRecord,
) -> Result<(), ReadModelError> {
    sqlx::query(
        r#"
        INSERT INTO rm_entities (tenant, label, id, fields, source_of_truth, placeholder, deleted, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (tenant, label, id)
        DO UPDATE SET fields = EXCLUDED.fields,
                      source_of_truth = EXCLUDED.source_of_truth,
                      placeholder = EXCLUDED.placeholder,
                      updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(tenant.as_str())
    .bind(&record.label)
    .bind(record.id.as_uuid())
    .bind(Value::Object(record.fields.clone()))
    .bind(&record.source_of_truth)
    .bind(record.placeholder)
    .bind(record.deleted)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| backend("upsert_entity", e))?;
    Ok(())
}

async fn insert_relation(
    tx: &mut Transaction<'_, Postgres>,
    tenant: &TenantId,
    relation: &Relation,
) -> Result<(), ReadModelError> {
    sqlx::query(
        r#"
        INSERT INTO rm_relations (tenant, from_label, from_id, kind, to_label, to_id, properties)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (tenant, from_label, from_id, kind, to_label, to_id)
        DO UPDATE SET properties = EXCLUDED.properties
        "#,
    )
    .bind(tenant.as_str())
    .bind(&relation.from.label)
    .bind(relation.from.id.as_uuid())
    .bind(&relation.kind)
    .bind(&relation.to.label)
    .bind(relation.to.id.as_uuid())
    .bind(Value::Object(relation.properties.clone()))
    .execute(&mut **tx)
    .await
    .map_err(|e| backend("insert_relation", e))?;
    Ok(())
}

fn record_from_row(row: &PgRow) -> Result<EntityRecord, ReadModelError> {
    let decode = |e: sqlx::Error| backend("decode_entity", e);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let label: String = row.try_get("label").map_err(decode)?;
    let fields = match row.try_get::<Value, _>("fields").map_err(decode)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ReadModelError::Malformed {
                label,
                id: EntityId::from_uuid(id),
                reason: format!("fields is not an object: {other}"),
            });
        }
    };
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    Ok(EntityRecord {
        label,
        id: EntityId::from_uuid(id),
        fields,
        source_of_truth: row.try_get("source_of_truth").map_err(decode)?,
        placeholder: row.try_get("placeholder").map_err(decode)?,
        deleted: row.try_get("deleted").map_err(decode)?,
        created_at,
        updated_at,
    })
}

fn relation_from_row(row: &PgRow) -> Result<Relation, ReadModelError> {
    let decode = |e: sqlx::Error| backend("decode_relation", e);
    let from_id: Uuid = row.try_get("from_id").map_err(decode)?;
    let to_id: Uuid = row.try_get("to_id").map_err(decode)?;
    let properties = match row.try_get::<Value, _>("properties").map_err(decode)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Relation {
        from: NodeRef::new(row.try_get::<String, _>("from_label").map_err(decode)?, EntityId::from_uuid(from_id)),
        kind: row.try_get("kind").map_err(decode)?,
        to: NodeRef::new(row.try_get::<String, _>("to_label").map_err(decode)?, EntityId::from_uuid(to_id)),
        properties,
    })
}

fn backend(operation: &str, err: sqlx::Error) -> ReadModelError {
    match err {
        sqlx::Error::Database(db_err) => {
            ReadModelError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => ReadModelError::Backend(format!("connection pool closed in {operation}")),
        other => ReadModelError::Backend(format!("{operation}: {other}")),
    }
}

fn malformed(node: &NodeRef, err: serde_json::Error) -> ReadModelError {
    ReadModelError::Malformed {
        label: node.label.clone(),
        id: node.id,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_is_keyed_by_tenant() {
        for statement in SCHEMA {
            assert!(statement.contains("PRIMARY KEY (tenant"), "{statement}");
        }
    }

    #[test]
    fn pool_errors_name_the_operation() {
        let err = backend("merge", sqlx::Error::PoolClosed);
        assert_eq!(err, ReadModelError::Backend("connection pool closed in merge".into()));
    }
}
