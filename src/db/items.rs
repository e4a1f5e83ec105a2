//! Content-addressed item store with additive merge.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::model::{Attributes, Item, ItemId, UpsertResult};
use crate::telemetry::metrics;

impl super::Db {
    /// Insert the item, or fill its absent/empty attributes from `attributes`.
    ///
    /// A single `INSERT ... ON CONFLICT DO UPDATE`, so racing upserts on one
    /// identity serialize on the row. `xmax = 0` distinguishes a fresh insert
    /// from an update.
    pub async fn upsert_item(&self, id: &ItemId, attributes: &Attributes) -> Result<UpsertResult> {
        let now = Utc::now();
        let (created,): (bool,) = sqlx::query_as(
            "INSERT INTO items (id, attributes, created_at, updated_at)
             VALUES (
                $1,
                COALESCE((SELECT jsonb_object_agg(e.key, e.value)
                          FROM jsonb_each($2::jsonb) AS e
                          WHERE NOT attr_is_empty(e.value)), '{}'::jsonb),
                $3, $3)
             ON CONFLICT (id) DO UPDATE
             SET attributes = items.attributes || COALESCE((
                    SELECT jsonb_object_agg(e.key, e.value)
                    FROM jsonb_each(EXCLUDED.attributes) AS e
                    WHERE attr_is_empty(items.attributes -> e.key)
                 ), '{}'::jsonb),
                 updated_at = EXCLUDED.updated_at
             RETURNING (xmax = 0)",
        )
        .bind(id.as_str())
        .bind(serde_json::Value::Object(attributes.clone()))
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        metrics::item_upserts().add(
            1,
            &[KeyValue::new(
                "result",
                if created { "created" } else { "merged" },
            )],
        );

        Ok(UpsertResult {
            item_id: id.clone(),
            created,
        })
    }

    /// Get an item by identity.
    pub async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        let row: Option<ItemRow> = sqlx::query_as(
            "SELECT id, attributes, created_at, updated_at FROM items WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(ItemRow::try_into_item).transpose()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    attributes: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ItemRow {
    fn try_into_item(self) -> Result<Item> {
        let id = ItemId::from_hex(self.id.clone())
            .ok_or_else(|| Error::Other(format!("stored item id is not a digest: {}", self.id)))?;
        let attributes = match self.attributes {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(Error::Other(format!(
                    "item {id} attributes are not an object: {other}"
                )));
            }
        };
        Ok(Item {
            id,
            attributes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
