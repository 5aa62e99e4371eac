use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::bucket::BucketKey;

// Attribute names of the wide-column key pair in the output table.
pub const PARTITION_KEY_ATTRIBUTE: &str = "PartitionKey";
pub const ROW_KEY_ATTRIBUTE: &str = "RowKey";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Retry-eligible: timeouts, throttling, server busy.
    #[error("transient store error: {0}")]
    Transient(String),
    /// Not retry-eligible: malformed request, authorization, size limits.
    #[error("permanent store error: {0}")]
    Permanent(String),
    /// The store cannot be reached at all; fatal for the whole batch.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// The key/value table the pipeline writes through. A trait object so the
/// dispatch path can be exercised against an in-memory store in tests.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Idempotent create-if-absent for the target table. Returns
    /// `StoreError::Unavailable` only when the store is unreachable; an
    /// already-existing table is success.
    async fn ensure_table(&self) -> Result<(), StoreError>;

    /// Create the row at `key` with exactly `fields` if absent, otherwise
    /// merge `fields` into it, leaving unlisted attributes untouched.
    async fn upsert_merge(
        &self,
        key: &BucketKey,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError>;
}

pub type DynTableStore = Arc<dyn TableStore>;

/// DynamoDB-backed table store. The row key pair maps onto a string
/// hash/range schema; upsert-merge maps onto `UpdateItem` with a `SET`
/// expression, which is a server-side partial update.
pub struct DynamoTableStore {
    client: Client,
    table_name: String,
}

impl DynamoTableStore {
    pub fn new(client: Client, table_name: String) -> Self {
        DynamoTableStore { client, table_name }
    }
}

#[async_trait]
impl TableStore for DynamoTableStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(PARTITION_KEY_ATTRIBUTE)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(|e| StoreError::Permanent(e.to_string()))?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(ROW_KEY_ATTRIBUTE)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(|e| StoreError::Permanent(e.to_string()))?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(PARTITION_KEY_ATTRIBUTE)
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(|e| StoreError::Permanent(e.to_string()))?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(ROW_KEY_ATTRIBUTE)
                    .key_type(KeyType::Range)
                    .build()
                    .map_err(|e| StoreError::Permanent(e.to_string()))?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %self.table_name, "created output table");
                Ok(())
            }
            Err(SdkError::ServiceError(ref context))
                if context.err().is_resource_in_use_exception() =>
            {
                Ok(())
            }
            Err(err @ (SdkError::DispatchFailure(_) | SdkError::TimeoutError(_))) => {
                Err(StoreError::Unavailable(err.to_string()))
            }
            Err(err) => {
                // The table may already exist without create permission;
                // the per-row upserts decide success from here.
                warn!(table = %self.table_name, error = %error_detail(&err), "create table failed");
                Ok(())
            }
        }
    }

    async fn upsert_merge(
        &self,
        key: &BucketKey,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(
                PARTITION_KEY_ATTRIBUTE,
                AttributeValue::S(key.partition_key.clone()),
            )
            .key(ROW_KEY_ATTRIBUTE, AttributeValue::S(key.row_key.clone()));

        if !fields.is_empty() {
            let mut clauses = Vec::with_capacity(fields.len());
            for (position, (field_id, value)) in fields.iter().enumerate() {
                let name = format!("#f{position}");
                let placeholder = format!(":v{position}");
                clauses.push(format!("{name} = {placeholder}"));
                request = request
                    .expression_attribute_names(name, field_id.clone())
                    .expression_attribute_values(placeholder, attribute_value(value));
            }
            request = request.update_expression(format!("SET {}", clauses.join(", ")));
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(classify_update_error)
    }
}

// Service error codes DynamoDB documents as retry-eligible.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionConflictException",
];

fn classify_update_error(err: SdkError<UpdateItemError>) -> StoreError {
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(err.to_string())
        }
        SdkError::ServiceError(context) => {
            let detail = error_detail(&err);
            if TRANSIENT_ERROR_CODES.contains(&context.err().code().unwrap_or_default()) {
                StoreError::Transient(detail)
            } else {
                StoreError::Permanent(detail)
            }
        }
        _ => StoreError::Permanent(err.to_string()),
    }
}

fn error_detail<E>(err: &SdkError<E>) -> String
where
    E: ProvideErrorMetadata,
{
    match err.as_service_error() {
        Some(service) => format!(
            "{}: {}",
            service.code().unwrap_or("unknown"),
            service.message().unwrap_or("no message"),
        ),
        None => err.to_string(),
    }
}

fn attribute_value(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(flag) => AttributeValue::Bool(*flag),
        Value::Number(number) => AttributeValue::N(number.to_string()),
        Value::String(text) => AttributeValue::S(text.clone()),
        // Compound payloads are stored as their JSON text.
        other => AttributeValue::S(other.to_string()),
    }
}
