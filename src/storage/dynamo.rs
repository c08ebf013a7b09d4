//! DynamoDB entity storage.
//!
//! The table uses `partitionKey` (hash) and `rowKey` (range), both strings.
//! Properties map onto DynamoDB attribute values one to one.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Number, Value};

use crate::error::{AppError, Result};
use crate::storage::{Entity, EntityStore};

const PARTITION_KEY: &str = "partitionKey";
const ROW_KEY: &str = "rowKey";

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-backed entity table.
#[derive(Debug, Clone)]
pub struct DynamoTable {
    client: Client,
    table: String,
}

impl DynamoTable {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    /// Create a table client from the ambient AWS configuration.
    pub async fn from_env(table: &str) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), table)
    }

    /// One result page, returning the items and the key to continue from.
    ///
    /// Queries a single partition when one is given, otherwise scans.
    async fn read_page(
        &self,
        partition: Option<&str>,
        start: Option<Item>,
    ) -> Result<(Vec<Item>, Option<Item>)> {
        let Some(partition) = partition else {
            let output = self
                .client
                .scan()
                .table_name(&self.table)
                .set_exclusive_start_key(start)
                .send()
                .await
                .map_err(|e| dynamo_error("scan", e))?;
            return Ok((
                output.items().to_vec(),
                output.last_evaluated_key().cloned(),
            ));
        };

        let output = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("#pk = :pk")
            .expression_attribute_names("#pk", PARTITION_KEY)
            .expression_attribute_values(":pk", AttributeValue::S(partition.to_string()))
            .set_exclusive_start_key(start)
            .send()
            .await
            .map_err(|e| dynamo_error("query", e))?;
        Ok((
            output.items().to_vec(),
            output.last_evaluated_key().cloned(),
        ))
    }

    fn paged(&self, partition: Option<String>) -> BoxStream<'_, Result<Entity>> {
        stream::unfold(ScanState::Start, move |state| {
            let partition = partition.clone();
            async move {
                let start = match state {
                    ScanState::Start => None,
                    ScanState::Next(key) => Some(key),
                    ScanState::Done => return None,
                };
                match self.read_page(partition.as_deref(), start).await {
                    Ok((items, last_key)) => {
                        let next = match last_key {
                            Some(key) if !key.is_empty() => ScanState::Next(key),
                            _ => ScanState::Done,
                        };
                        let page: Vec<Result<Entity>> = items.iter().map(from_item).collect();
                        Some((stream::iter(page), next))
                    }
                    Err(e) => Some((stream::iter(vec![Err(e)]), ScanState::Done)),
                }
            }
        })
        .flatten()
        .boxed()
    }
}

fn dynamo_error(op: &str, e: impl std::error::Error) -> AppError {
    AppError::storage(format!("DynamoDB {op}: {}", DisplayErrorContext(e)))
}

fn key_item(partition_key: &str, row_key: &str) -> Item {
    HashMap::from([
        (
            PARTITION_KEY.to_string(),
            AttributeValue::S(partition_key.to_string()),
        ),
        (ROW_KEY.to_string(), AttributeValue::S(row_key.to_string())),
    ])
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attribute(v)))
                .collect(),
        ),
    }
}

fn from_attribute(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(Value::from)
            .ok()
            .or_else(|| n.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number))
            .unwrap_or_else(|| Value::String(n.clone())),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::L(items) => Value::Array(items.iter().map(from_attribute).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), from_attribute(v)))
                .collect(),
        ),
        AttributeValue::Ss(items) => {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }
        _ => Value::Null,
    }
}

fn to_item(entity: &Entity) -> Item {
    let mut item = key_item(&entity.partition_key, &entity.row_key);
    for (name, value) in &entity.properties {
        item.insert(name.clone(), to_attribute(value));
    }
    item
}

fn from_item(item: &Item) -> Result<Entity> {
    let key = |name: &str| match item.get(name) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        _ => Err(AppError::storage(format!("DynamoDB item without string {name}"))),
    };
    let properties: Map<String, Value> = item
        .iter()
        .filter(|(name, _)| name.as_str() != PARTITION_KEY && name.as_str() != ROW_KEY)
        .map(|(name, value)| (name.clone(), from_attribute(value)))
        .collect();

    Ok(Entity {
        partition_key: key(PARTITION_KEY)?,
        row_key: key(ROW_KEY)?,
        properties,
    })
}

enum ScanState {
    Start,
    Next(Item),
    Done,
}

#[async_trait]
impl EntityStore for DynamoTable {
    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Option<Entity> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(key_item(partition_key, row_key)))
            .send()
            .await;

        match result {
            Ok(output) => output.item().and_then(|item| from_item(item).ok()),
            Err(e) => {
                log::warn!("{}", dynamo_error("get_item", e));
                None
            }
        }
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        if entity.partition_key.is_empty() || entity.row_key.is_empty() {
            return Err(AppError::validation(
                "entity partitionKey and rowKey must be non-empty",
            ));
        }
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_item(&entity)))
            .send()
            .await
            .map_err(|e| dynamo_error("put_item", e))?;
        Ok(())
    }

    fn list_entities(&self) -> BoxStream<'_, Result<Entity>> {
        self.paged(None)
    }

    fn list_partition(&self, partition_key: &str) -> BoxStream<'_, Result<Entity>> {
        self.paged(Some(partition_key.to_string()))
    }

    async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .set_key(Some(key_item(partition_key, row_key)))
            .send()
            .await
            .map_err(|e| dynamo_error("delete_item", e))?;
        Ok(())
    }
}
