use crate::client_bail;
use crate::config::Settings;
use crate::tools::PinnedBytesStream;
use crate::web::error::ResultExt;
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{MetadataDirective, ServerSideEncryption};
use aws_sdk_s3::{Client, config};
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct S3Client {
    pub client: Client,
    bucket: String,
    data_prefix: String,
}

/// Content accepted by [`S3Client::upload`]. Everything is normalized to
/// bytes before the transfer.
pub enum UploadBody {
    Bytes(Vec<u8>),
    Text(String),
    Stream(PinnedBytesStream),
}

#[derive(Debug, Serialize)]
pub struct UploadInfo {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: usize,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct StoredObject {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<String>,
    pub etag: String,
    pub storage_class: String,
}

#[derive(Debug, Serialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<String>,
    pub etag: String,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// A dataset held in memory as rows of JSON values under named columns.
#[derive(Debug)]
pub struct TabularDataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DatasetKind {
    Interactions,
    Users,
    Items,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Interactions => "interactions",
            DatasetKind::Users => "users",
            DatasetKind::Items => "items",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<DatasetKind> {
        match value {
            "interactions" => Ok(DatasetKind::Interactions),
            "users" => Ok(DatasetKind::Users),
            "items" => Ok(DatasetKind::Items),
            other => client_bail!(
                "Invalid dataset type '{}'. Must be one of: interactions, users, items",
                other
            ),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DatasetFormat {
    Csv,
    Json,
}

impl DatasetFormat {
    fn extension(&self) -> &'static str {
        match self {
            DatasetFormat::Csv => "csv",
            DatasetFormat::Json => "json",
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            DatasetFormat::Csv => "text/csv",
            DatasetFormat::Json => "application/json",
        }
    }
}

impl FromStr for DatasetFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<DatasetFormat> {
        match value {
            "csv" => Ok(DatasetFormat::Csv),
            "json" => Ok(DatasetFormat::Json),
            other => client_bail!("Unsupported dataset format '{}'. Use one of: csv, json", other),
        }
    }
}

impl S3Client {
    pub fn new(sdk_config: &SdkConfig, settings: &Settings) -> S3Client {
        tracing::info!("Setting up S3....");
        let s3_config = config::Builder::from(sdk_config)
            .force_path_style(true)
            .build();

        S3Client {
            client: Client::from_conf(s3_config),
            bucket: settings.s3_bucket_name.clone(),
            data_prefix: settings.s3_data_prefix.clone(),
        }
    }

    /// All object keys carry a `{tenant_id}/` prefix; callers never see it.
    fn full_key(&self, tenant_id: &str, key: &str) -> String {
        format!("{}/{}", tenant_id, key)
    }

    fn strip_tenant_prefix(tenant_id: &str, key: &str) -> String {
        key.strip_prefix(&format!("{}/", tenant_id))
            .unwrap_or(key)
            .to_string()
    }

    fn object_url(&self, full_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, full_key)
    }

    #[tracing::instrument(level = "debug", skip(self, body, extra_metadata), err(Display))]
    pub async fn upload(
        &self,
        tenant_id: &str,
        key: &str,
        body: UploadBody,
        content_type: &str,
        extra_metadata: Option<HashMap<String, String>>,
    ) -> anyhow::Result<UploadInfo> {
        let full_key = self.full_key(tenant_id, key);
        let data = normalize_body(body).await?;
        let size = data.len();

        let mut metadata = HashMap::from([
            ("tenant_id".to_string(), tenant_id.to_string()),
            ("uploaded_at".to_string(), Utc::now().to_rfc3339()),
            ("content_type".to_string(), content_type.to_string()),
        ]);
        if let Some(extra) = extra_metadata {
            metadata.extend(extra);
        }

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .set_metadata(Some(metadata))
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .with_context(|| {
                format!("Failed to store object '{}' in bucket '{}'", full_key, self.bucket)
            })?;

        tracing::debug!("Uploaded '{}' ({} bytes)", full_key, size);

        Ok(UploadInfo {
            bucket: self.bucket.clone(),
            key: full_key.clone(),
            etag: result.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            size,
            url: self.object_url(&full_key),
        })
    }

    /// Downloads an object. A missing object is reported as a not-found
    /// condition, distinct from a generic upstream failure.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn download(&self, tenant_id: &str, key: &str) -> anyhow::Result<bytes::Bytes> {
        let full_key = self.full_key(tenant_id, key);

        let result = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(result) => result,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false) =>
            {
                return Err(anyhow::anyhow!("File '{}' not found", key)).mark_not_found();
            }
            Err(err) => {
                return Err(err).context(format!(
                    "Failed to fetch object '{}' from bucket '{}'",
                    full_key, self.bucket
                ));
            }
        };

        let data = result
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read object '{}'", full_key))?
            .into_bytes();

        Ok(data)
    }

    /// Lists objects under the given prefix, with the tenant segment
    /// stripped from the returned keys.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn list(
        &self,
        tenant_id: &str,
        prefix: &str,
        max_keys: i32,
    ) -> anyhow::Result<Vec<StoredObject>> {
        let full_prefix = self.full_key(tenant_id, prefix);

        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .max_keys(max_keys)
            .send()
            .await
            .with_context(|| format!("Failed to list objects for tenant '{}'", tenant_id))?;

        let objects = result
            .contents
            .unwrap_or_default()
            .into_iter()
            .map(|object| StoredObject {
                key: Self::strip_tenant_prefix(tenant_id, object.key().unwrap_or_default()),
                size: object.size().unwrap_or(0),
                last_modified: object.last_modified().map(|ts| ts.to_string()),
                etag: object.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                storage_class: object
                    .storage_class()
                    .map(|class| class.as_str().to_string())
                    .unwrap_or_else(|| "STANDARD".to_string()),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            "Listed {} objects for tenant '{}' with prefix '{}'",
            objects.len(),
            tenant_id,
            prefix
        );
        Ok(objects)
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn delete(&self, tenant_id: &str, key: &str) -> anyhow::Result<()> {
        let full_key = self.full_key(tenant_id, key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .with_context(|| {
                format!("Failed to delete '{}' from bucket '{}'", full_key, self.bucket)
            })?;

        Ok(())
    }

    /// Copies an object within the tenant's namespace, replacing its
    /// metadata.
    #[tracing::instrument(level = "debug", skip(self, extra_metadata), err(Display))]
    pub async fn copy(
        &self,
        tenant_id: &str,
        source_key: &str,
        dest_key: &str,
        extra_metadata: Option<HashMap<String, String>>,
    ) -> anyhow::Result<UploadInfo> {
        let source_full_key = self.full_key(tenant_id, source_key);
        let dest_full_key = self.full_key(tenant_id, dest_key);

        let mut metadata = HashMap::from([
            ("tenant_id".to_string(), tenant_id.to_string()),
            ("copied_at".to_string(), Utc::now().to_rfc3339()),
            ("source_key".to_string(), source_key.to_string()),
        ]);
        if let Some(extra) = extra_metadata {
            metadata.extend(extra);
        }

        let result = self
            .client
            .copy_object()
            .copy_source(format!("{}/{}", self.bucket, source_full_key))
            .bucket(&self.bucket)
            .key(&dest_full_key)
            .set_metadata(Some(metadata))
            .metadata_directive(MetadataDirective::Replace)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .with_context(|| {
                format!("Failed to copy '{}' to '{}'", source_full_key, dest_full_key)
            })?;

        Ok(UploadInfo {
            bucket: self.bucket.clone(),
            key: dest_full_key.clone(),
            etag: result
                .copy_object_result()
                .and_then(|r| r.e_tag())
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
            size: 0,
            url: self.object_url(&dest_full_key),
        })
    }

    /// Fetches object metadata. A missing object is a not-found condition.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn object_metadata(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> anyhow::Result<ObjectMetadata> {
        let full_key = self.full_key(tenant_id, key);

        let result = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(result) => result,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                return Err(anyhow::anyhow!("File '{}' not found", key)).mark_not_found();
            }
            Err(err) => {
                return Err(err)
                    .context(format!("Failed to read metadata of '{}'", full_key));
            }
        };

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: result.content_length().unwrap_or(0),
            last_modified: result.last_modified().map(|ts| ts.to_string()),
            etag: result.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            content_type: result
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
            metadata: result.metadata().cloned().unwrap_or_default(),
        })
    }

    /// Generates a presigned download URL for temporary direct access.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn presigned_url(
        &self,
        tenant_id: &str,
        key: &str,
        expires_in: Duration,
    ) -> anyhow::Result<String> {
        let full_key = self.full_key(tenant_id, key);

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .presigned(
                PresigningConfig::expires_in(expires_in)
                    .context("Invalid presigned URL expiry")?,
            )
            .await
            .with_context(|| format!("Failed to generate presigned URL for '{}'", full_key))?;

        Ok(request.uri().to_string())
    }

    /// Serializes an in-memory dataset and uploads it for the recommender
    /// to import. Row and column counts travel along as object metadata.
    #[tracing::instrument(level = "debug", skip(self, dataset), err(Display))]
    pub async fn upload_dataset(
        &self,
        tenant_id: &str,
        dataset: &TabularDataset,
        kind: DatasetKind,
        format: DatasetFormat,
    ) -> anyhow::Result<UploadInfo> {
        let content = serialize_dataset(dataset, format)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let key = format!(
            "{}/{}/{}.{}",
            self.data_prefix,
            kind.as_str(),
            timestamp,
            format.extension()
        );

        let metadata = HashMap::from([
            ("dataset_type".to_string(), kind.as_str().to_string()),
            ("format".to_string(), format.extension().to_string()),
            ("rows".to_string(), dataset.rows.len().to_string()),
            ("columns".to_string(), dataset.columns.len().to_string()),
        ]);

        self.upload(
            tenant_id,
            &key,
            UploadBody::Text(content),
            format.content_type(),
            Some(metadata),
        )
        .await
    }
}

async fn normalize_body(body: UploadBody) -> anyhow::Result<Vec<u8>> {
    match body {
        UploadBody::Bytes(data) => Ok(data),
        UploadBody::Text(text) => Ok(text.into_bytes()),
        UploadBody::Stream(mut stream) => {
            let mut data = Vec::new();
            while let Some(chunk) = stream
                .try_next()
                .await
                .context("Failed to read upload stream")?
            {
                data.extend_from_slice(&chunk);
            }
            Ok(data)
        }
    }
}

fn serialize_dataset(dataset: &TabularDataset, format: DatasetFormat) -> anyhow::Result<String> {
    for (index, row) in dataset.rows.iter().enumerate() {
        if row.len() != dataset.columns.len() {
            client_bail!(
                "Row {} has {} values but the dataset has {} columns",
                index,
                row.len(),
                dataset.columns.len()
            );
        }
    }

    match format {
        DatasetFormat::Csv => Ok(to_csv(dataset)),
        DatasetFormat::Json => to_json_lines(dataset),
    }
}

fn to_csv(dataset: &TabularDataset) -> String {
    let mut output = String::new();

    let header = dataset
        .columns
        .iter()
        .map(|column| csv_field(column))
        .collect::<Vec<_>>()
        .join(",");
    output.push_str(&header);
    output.push('\n');

    for row in &dataset.rows {
        let line = row
            .iter()
            .map(|value| match value {
                Value::String(text) => csv_field(text),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",");
        output.push_str(&line);
        output.push('\n');
    }

    output
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One JSON object per line, column names as keys.
fn to_json_lines(dataset: &TabularDataset) -> anyhow::Result<String> {
    let mut output = String::new();

    for row in &dataset.rows {
        let record: serde_json::Map<String, Value> = dataset
            .columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect();
        output.push_str(
            &serde_json::to_string(&record).context("Failed to serialize dataset row")?,
        );
        output.push('\n');
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::test::test_run_id;
    use serde_json::json;

    #[test]
    fn full_key_applies_the_tenant_prefix() {
        let client = test_client();
        assert_eq!(client.full_key("t1", "x.csv"), "t1/x.csv");
        assert_eq!(
            client.full_key("t1", "datasets/interactions/x.csv"),
            "t1/datasets/interactions/x.csv"
        );
    }

    #[test]
    fn strip_tenant_prefix_removes_exactly_one_leading_segment() {
        assert_eq!(S3Client::strip_tenant_prefix("t1", "t1/x.csv"), "x.csv");
        assert_eq!(
            S3Client::strip_tenant_prefix("t1", "t1/t1/x.csv"),
            "t1/x.csv"
        );
        assert_eq!(S3Client::strip_tenant_prefix("t1", "other.csv"), "other.csv");
    }

    #[test]
    fn dataset_kind_parses_known_values_only() {
        assert_eq!("interactions".parse::<DatasetKind>().unwrap(), DatasetKind::Interactions);
        assert_eq!("users".parse::<DatasetKind>().unwrap(), DatasetKind::Users);
        assert!("orders".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn dataset_format_rejects_parquet() {
        assert!("parquet".parse::<DatasetFormat>().is_err());
        assert_eq!("csv".parse::<DatasetFormat>().unwrap(), DatasetFormat::Csv);
    }

    fn sample_dataset() -> TabularDataset {
        TabularDataset {
            columns: vec!["user_id".to_string(), "item_id".to_string(), "rating".to_string()],
            rows: vec![
                vec![json!("u1"), json!("sku-1"), json!(4.5)],
                vec![json!("u2"), json!("sku,2"), json!(3)],
            ],
        }
    }

    #[test]
    fn csv_serialization_escapes_delimiters() {
        let csv = to_csv(&sample_dataset());
        assert_eq!(csv, "user_id,item_id,rating\nu1,sku-1,4.5\nu2,\"sku,2\",3\n");
    }

    #[test]
    fn csv_serialization_escapes_embedded_quotes() {
        let dataset = TabularDataset {
            columns: vec!["note".to_string()],
            rows: vec![vec![json!("say \"hi\"")]],
        };
        assert_eq!(to_csv(&dataset), "note\n\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn json_lines_serialization_emits_one_object_per_row() {
        let jsonl = to_json_lines(&sample_dataset()).unwrap();
        let lines: Vec<_> = jsonl.lines().collect();

        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["user_id"], json!("u1"));
        assert_eq!(first["rating"], json!(4.5));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let dataset = TabularDataset {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![json!(1)]],
        };
        assert!(serialize_dataset(&dataset, DatasetFormat::Csv).is_err());
    }

    fn test_client() -> S3Client {
        use crate::config::Settings;
        use std::collections::HashMap;

        let vars = HashMap::from([
            ("S3_BUCKET_NAME", "saffron-test"),
            ("DYNAMO_RECOMMENDATIONS_TABLE", "recommendations"),
            ("DYNAMO_USER_PROFILES_TABLE", "user-profiles"),
            ("DYNAMO_CAMPAIGN_TRACKING_TABLE", "campaign-tracking"),
            ("PERSONALIZE_DATASET_GROUP", "retail"),
            ("PERSONALIZE_ROLE_ARN", "arn:aws:iam::123456789012:role/PersonalizeRole"),
            ("PINPOINT_APPLICATION_ID", "abc123"),
            ("PINPOINT_FROM_ADDRESS", "noreply@example.com"),
            (
                "TRAINING_STATE_MACHINE_ARN",
                "arn:aws:states:us-east-1:123456789012:stateMachine:training",
            ),
            ("API_KEY", "secret"),
        ]);
        let settings =
            Settings::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        let sdk_config = aws_config::SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .build();
        S3Client::new(&sdk_config, &settings)
    }

    #[tokio::test]
    #[ignore]
    async fn upload_download_round_trip_against_real_bucket() {
        let settings = crate::config::Settings::from_env().unwrap();
        let sdk_config = crate::aws::load_sdk_config(&settings).await;
        let client = S3Client::new(&sdk_config, &settings);

        let tenant = format!("test-tenant-{}", test_run_id());
        let key = "round-trip.txt";

        client
            .upload(
                &tenant,
                key,
                UploadBody::Text("saffron".to_string()),
                "text/plain",
                None,
            )
            .await
            .unwrap();

        let data = client.download(&tenant, key).await.unwrap();
        assert_eq!(&data[..], b"saffron");

        let listed = client.list(&tenant, "", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);

        client.delete(&tenant, key).await.unwrap();
        assert!(client.download(&tenant, key).await.is_err());
    }
}
