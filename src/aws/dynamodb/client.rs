use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::operation::delete_item::builders::DeleteItemFluentBuilder;
use aws_sdk_dynamodb::operation::get_item::builders::GetItemFluentBuilder;
use aws_sdk_dynamodb::operation::put_item::builders::PutItemFluentBuilder;
use aws_sdk_dynamodb::operation::query::builders::QueryFluentBuilder;
use aws_sdk_dynamodb::operation::update_item::builders::UpdateItemFluentBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Clone, Debug)]
pub struct DynamoClient {
    pub client: Client,
}

impl DynamoClient {
    pub fn new(config: &SdkConfig) -> DynamoClient {
        tracing::info!("Setting up DynamoDB....");
        DynamoClient {
            client: Client::new(config),
        }
    }

    pub fn put_item(&self, table_name: &str) -> PutItemFluentBuilder {
        self.client.put_item().table_name(table_name)
    }

    pub fn get_item(&self, table_name: &str) -> GetItemFluentBuilder {
        self.client.get_item().table_name(table_name)
    }

    pub fn query(&self, table_name: &str) -> QueryFluentBuilder {
        self.client.query().table_name(table_name)
    }

    pub fn update_item(&self, table_name: &str) -> UpdateItemFluentBuilder {
        self.client.update_item().table_name(table_name)
    }

    pub fn delete_item(&self, table_name: &str) -> DeleteItemFluentBuilder {
        self.client.delete_item().table_name(table_name)
    }

    /// Runs a query to completion, following the pagination cursor, and
    /// deserializes every item.
    pub async fn query_all<E>(query_fluent_builder: QueryFluentBuilder) -> anyhow::Result<Vec<E>>
    where
        E: Serialize + DeserializeOwned,
    {
        let mut entities = Vec::new();
        let mut last_key = None;

        loop {
            let result = query_fluent_builder
                .clone()
                .set_exclusive_start_key(last_key)
                .send()
                .await
                .context("Error executing paginated query")?;

            for item in result.items.unwrap_or_default() {
                entities.push(
                    serde_dynamo::aws_sdk_dynamodb_1::from_item(item)
                        .context("Failed to deserialize DynamoDB item")?,
                );
            }

            match result.last_evaluated_key {
                Some(next_key) => last_key = Some(next_key),
                None => return Ok(entities),
            }
        }
    }

    /// Runs a single query page and deserializes its items. Use this where
    /// the query's `limit` is the intended result bound (e.g. "most recent
    /// N events").
    pub async fn query_page<E>(query_fluent_builder: QueryFluentBuilder) -> anyhow::Result<Vec<E>>
    where
        E: Serialize + DeserializeOwned,
    {
        let result = query_fluent_builder
            .send()
            .await
            .context("Error executing query")?;

        result
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|item| {
                serde_dynamo::aws_sdk_dynamodb_1::from_item(item)
                    .context("Failed to deserialize DynamoDB item")
            })
            .collect()
    }
}
