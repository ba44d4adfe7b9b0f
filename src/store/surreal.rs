//! SurrealDB-backed definition store.
//!
//! All definition kinds live in the `definition` table, discriminated by the
//! `kind` column. Payloads are stored as JSON objects so filter expressions
//! can be pushed down into SurrealQL.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Db, StoredDefinition, StoredHeader};
use crate::definitions::{Definition, DefinitionHeader, DefinitionRecord};
use crate::filter::{Filter, FilterExpr};
use crate::store::DefinitionStore;

pub struct SurrealDefinitionStore<T> {
    db: Db,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for SurrealDefinitionStore<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            _kind: PhantomData,
        }
    }
}

impl<T: Definition> SurrealDefinitionStore<T> {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            _kind: PhantomData,
        }
    }

    fn record_key(id: Uuid) -> String {
        format!("{}_{}", T::KIND, id.simple())
    }

    /// Insert or replace a definition. The ETag is derived from the payload,
    /// so writing an unchanged payload keeps the stored ETag.
    pub async fn put(&self, payload: T) -> Result<DefinitionRecord<T>> {
        let record = DefinitionRecord::new(payload)?;
        let payload = serde_json::to_value(&record.payload)?;

        self.db
            .query(
                r#"
                UPSERT type::thing('definition', $key) CONTENT {
                    uid: $uid,
                    kind: $kind,
                    etag: $etag,
                    payload: $payload
                } RETURN NONE
                "#,
            )
            .bind(("key", Self::record_key(record.id)))
            .bind(("uid", record.id.to_string()))
            .bind(("kind", T::KIND))
            .bind(("etag", record.etag.clone().into_inner()))
            .bind(("payload", payload))
            .await?
            .check()?;

        debug!("Stored {} definition {} ({})", T::KIND, record.id, record.etag);
        Ok(record)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.db
            .query("DELETE definition WHERE kind = $kind AND uid = $uid")
            .bind(("kind", T::KIND))
            .bind(("uid", id.to_string()))
            .await?
            .check()?;

        debug!("Deleted {} definition {}", T::KIND, id);
        Ok(())
    }

    async fn select(
        &self,
        condition: &str,
        binds: Vec<(String, Value)>,
    ) -> Result<Vec<DefinitionRecord<T>>> {
        let query = format!(
            "SELECT uid, etag, payload FROM definition WHERE kind = $kind AND ({})",
            condition
        );

        let mut request = self.db.query(query).bind(("kind", T::KIND));
        for bind in binds {
            request = request.bind(bind);
        }

        let mut res = request.await?;
        let rows: Vec<StoredDefinition> = res.take(0)?;

        rows.into_iter().map(StoredDefinition::into_record).collect()
    }
}

#[async_trait]
impl<T: Definition> DefinitionStore<T> for SurrealDefinitionStore<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<DefinitionRecord<T>>> {
        let records = self
            .select(
                "uid = $uid",
                vec![("uid".to_string(), Value::String(id.to_string()))],
            )
            .await?;

        Ok(records.into_iter().next())
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<DefinitionRecord<T>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let uids: Vec<Value> = ids.iter().map(|id| Value::String(id.to_string())).collect();
        self.select("uid IN $uids", vec![("uids".to_string(), Value::Array(uids))])
            .await
    }

    async fn query(&self, filter: &Filter<T>) -> Result<Vec<DefinitionRecord<T>>> {
        let pushed_down = filter.expr().and_then(to_surql);

        let candidates = match pushed_down {
            Some((condition, binds)) => self.select(&condition, binds).await?,
            None => {
                debug!("Filter on {} cannot be pushed down, scanning", T::KIND);
                self.select("true", Vec::new()).await?
            }
        };

        // The compiled predicate has the final say so both paths agree.
        Ok(candidates
            .into_iter()
            .filter(|record| filter.matches(&record.payload))
            .collect())
    }

    async fn list_headers(&self) -> Result<Vec<DefinitionHeader>> {
        let mut res = self
            .db
            .query("SELECT uid, etag FROM definition WHERE kind = $kind")
            .bind(("kind", T::KIND))
            .await?;

        let rows: Vec<StoredHeader> = res.take(0)?;
        rows.into_iter().map(StoredHeader::into_header).collect()
    }
}

/// Translate a filter expression into a SurrealQL condition over `payload`
/// plus its parameter bindings. Returns `None` when a field path cannot be
/// expressed safely.
fn to_surql(expr: &FilterExpr) -> Option<(String, Vec<(String, Value)>)> {
    let mut binds = Vec::new();
    let condition = render(expr, &mut binds)?;
    Some((condition, binds))
}

fn render(expr: &FilterExpr, binds: &mut Vec<(String, Value)>) -> Option<String> {
    let bind = |value: &Value, binds: &mut Vec<(String, Value)>| {
        let name = format!("p{}", binds.len());
        binds.push((name.clone(), value.clone()));
        format!("${}", name)
    };

    Some(match expr {
        FilterExpr::All => "true".to_string(),
        FilterExpr::Eq { field, value } => {
            format!("{} = {}", field_path(field)?, bind(value, binds))
        }
        FilterExpr::Ne { field, value } => {
            format!("{} != {}", field_path(field)?, bind(value, binds))
        }
        FilterExpr::Exists { field } => {
            let path = field_path(field)?;
            format!("({path} != NONE AND {path} != NULL)")
        }
        FilterExpr::And(exprs) => join(exprs, " AND ", "true", binds)?,
        FilterExpr::Or(exprs) => join(exprs, " OR ", "false", binds)?,
        FilterExpr::Not(inner) => format!("!({})", render(inner, binds)?),
    })
}

fn join(
    exprs: &[FilterExpr],
    separator: &str,
    empty: &str,
    binds: &mut Vec<(String, Value)>,
) -> Option<String> {
    if exprs.is_empty() {
        return Some(empty.to_string());
    }

    let parts = exprs
        .iter()
        .map(|e| render(e, binds))
        .collect::<Option<Vec<_>>>()?;
    Some(format!("({})", parts.join(separator)))
}

/// `a.b.0` becomes `payload.a.b[0]`. Only plain identifiers and array
/// indices are accepted.
fn field_path(field: &str) -> Option<String> {
    let mut path = String::from("payload");

    for segment in field.split('.') {
        if segment.is_empty() {
            return None;
        }
        if segment.chars().all(|c| c.is_ascii_digit()) {
            path.push_str(&format!("[{}]", segment));
        } else if segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !segment.starts_with(|c: char| c.is_ascii_digit())
        {
            path.push('.');
            path.push_str(segment);
        } else {
            return None;
        }
    }

    Some(path)
}
