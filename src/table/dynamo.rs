//! DynamoDB-backed conditional table.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue as DynamoValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use tracing::trace;

use super::expression::render;
use super::item::{
    AttributeValue, ConditionalTable, Item, ItemKey, ReturnValues, TableError, UpdateRequest,
};

const DEFAULT_PARTITION_ATTR: &str = "resourceName";
const DEFAULT_SORT_ATTR: &str = "accountId";

/// A [`ConditionalTable`] stored in DynamoDB.
///
/// Every logical table maps to a DynamoDB table with a string partition key
/// and a string sort key, `resourceName` and `accountId` unless overridden.
/// Key attribute names must not clash with the attributes the limiter
/// writes. Reads are strongly consistent.
#[derive(Debug, Clone)]
pub struct DynamoTable {
    client: Client,
    partition_attr: String,
    sort_attr: String,
}

impl DynamoTable {
    /// Wrap an already configured client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            partition_attr: DEFAULT_PARTITION_ATTR.to_string(),
            sort_attr: DEFAULT_SORT_ATTR.to_string(),
        }
    }

    /// Use different key attribute names.
    pub fn with_key_attributes(mut self, partition: &str, sort: &str) -> Self {
        self.partition_attr = partition.to_string();
        self.sort_attr = sort.to_string();
        self
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn key(&self, key: &ItemKey) -> HashMap<String, DynamoValue> {
        HashMap::from([
            (self.partition_attr.clone(), DynamoValue::S(key.partition.clone())),
            (self.sort_attr.clone(), DynamoValue::S(key.sort.clone())),
        ])
    }
}

#[async_trait]
impl ConditionalTable for DynamoTable {
    async fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, TableError> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(self.key(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(backend_error)?;

        output.item().map(from_dynamo).transpose()
    }

    async fn put_item(&self, table: &str, key: &ItemKey, item: Item) -> Result<(), TableError> {
        let mut attributes: HashMap<String, DynamoValue> = item
            .iter()
            .map(|(name, value)| (name.clone(), to_dynamo(value)))
            .collect();
        attributes.extend(self.key(key));

        self.client
            .put_item()
            .table_name(table)
            .set_item(Some(attributes))
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn update_item(&self, request: UpdateRequest) -> Result<Option<Item>, TableError> {
        let expressions = render(&request);
        trace!(
            table = %request.table,
            update = %expressions.update,
            condition = ?expressions.condition,
            "Issuing conditional update"
        );

        let values: HashMap<String, DynamoValue> = expressions
            .values
            .iter()
            .map(|(placeholder, value)| (placeholder.clone(), to_dynamo(value)))
            .collect();
        let return_value = match request.return_values {
            ReturnValues::AllNew => ReturnValue::AllNew,
            ReturnValues::None => ReturnValue::None,
        };

        let result = self
            .client
            .update_item()
            .table_name(&request.table)
            .set_key(Some(self.key(&request.key)))
            .update_expression(expressions.update)
            .set_condition_expression(expressions.condition)
            .set_expression_attribute_names(Some(expressions.names))
            .set_expression_attribute_values((!values.is_empty()).then_some(values))
            .return_values(return_value)
            .send()
            .await;

        match result {
            Ok(output) => match request.return_values {
                ReturnValues::AllNew => output.attributes().map(from_dynamo).transpose(),
                ReturnValues::None => Ok(None),
            },
            Err(err)
                if matches!(
                    err.as_service_error(),
                    Some(UpdateItemError::ConditionalCheckFailedException(_))
                ) =>
            {
                Err(TableError::ConditionalCheckFailed)
            }
            Err(err) => Err(backend_error(err)),
        }
    }
}

fn to_dynamo(value: &AttributeValue) -> DynamoValue {
    match value {
        AttributeValue::S(s) => DynamoValue::S(s.clone()),
        AttributeValue::N(n) => DynamoValue::N(n.to_string()),
    }
}

/// Convert a returned item. Attribute types the limiter never writes are
/// skipped.
fn from_dynamo(attributes: &HashMap<String, DynamoValue>) -> Result<Item, TableError> {
    let mut item = Item::new();
    for (name, value) in attributes {
        let value = match value {
            DynamoValue::S(s) => AttributeValue::S(s.clone()),
            DynamoValue::N(n) => AttributeValue::N(n.parse().map_err(|_| {
                TableError::Backend(format!("attribute {} holds a malformed number: {}", name, n))
            })?),
            _ => continue,
        };
        item.insert(name.clone(), value);
    }
    Ok(item)
}

fn backend_error<E, R>(err: SdkError<E, R>) -> TableError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    TableError::Backend(DisplayErrorContext(&err).to_string())
}
