//! Amazon Personalize adapter.
//!
//! Every resource name is derived from a configured prefix plus the tenant
//! id, which makes creation idempotent: when the service reports that the
//! resource already exists, the adapter falls back to a lookup by the
//! derived name and returns the existing resource instead of failing.

use crate::aws::dynamodb::store::RecommendedItem;
use crate::config::Settings;
use crate::web::error::ResultExt;
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_personalize::types::{DataSource, Tag};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

const LIST_PAGE_SIZE: i32 = 100;

#[derive(Clone, Debug)]
pub struct PersonalizeClient {
    client: aws_sdk_personalize::Client,
    runtime: aws_sdk_personalizeruntime::Client,
    events: aws_sdk_personalizeevents::Client,
    dataset_group_prefix: String,
    solution_prefix: String,
    campaign_prefix: String,
    role_arn: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResourceInfo {
    pub name: String,
    pub arn: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ImportJobInfo {
    pub job_name: String,
    pub import_job_arn: String,
    pub data_source: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct TrackedEvent {
    pub event_type: String,
    pub event_id: Option<String>,
    pub item_id: Option<String>,
    pub event_value: Option<f32>,
    pub properties: Option<Value>,
    /// Epoch seconds; defaults to the current time.
    pub sent_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Training,
    Ready,
    Failed,
    Incomplete,
}

impl Display for OverallStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OverallStatus::Training => "TRAINING",
            OverallStatus::Ready => "READY",
            OverallStatus::Failed => "FAILED",
            OverallStatus::Incomplete => "INCOMPLETE",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Serialize)]
pub struct TrainingStatus {
    pub tenant_id: String,
    pub overall_status: OverallStatus,
    pub components: BTreeMap<String, String>,
}

impl PersonalizeClient {
    pub fn new(sdk_config: &SdkConfig, settings: &Settings) -> PersonalizeClient {
        tracing::info!("Setting up Personalize....");
        PersonalizeClient {
            client: aws_sdk_personalize::Client::new(sdk_config),
            runtime: aws_sdk_personalizeruntime::Client::new(sdk_config),
            events: aws_sdk_personalizeevents::Client::new(sdk_config),
            dataset_group_prefix: settings.dataset_group_prefix.clone(),
            solution_prefix: settings.solution_prefix.clone(),
            campaign_prefix: settings.campaign_prefix.clone(),
            role_arn: settings.personalize_role_arn.clone(),
        }
    }

    pub fn dataset_group_name(&self, tenant_id: &str) -> String {
        format!("{}-{}", self.dataset_group_prefix, tenant_id)
    }

    pub fn solution_name(&self, tenant_id: &str) -> String {
        format!("{}-{}", self.solution_prefix, tenant_id)
    }

    pub fn campaign_name(&self, tenant_id: &str) -> String {
        format!("{}-{}", self.campaign_prefix, tenant_id)
    }

    pub fn dataset_name(dataset_type: &str, tenant_id: &str) -> String {
        format!("{}-{}", dataset_type.to_lowercase(), tenant_id)
    }

    fn tenant_tag(tenant_id: &str) -> anyhow::Result<Tag> {
        Tag::builder()
            .tag_key("TenantId")
            .tag_value(tenant_id)
            .build()
            .context("Failed to build tenant tag")
    }

    #[tracing::instrument(skip(self), err(Display))]
    pub async fn create_dataset_group(&self, tenant_id: &str) -> anyhow::Result<ResourceInfo> {
        let name = self.dataset_group_name(tenant_id);

        create_or_lookup(
            "dataset group",
            &name,
            async {
                match self
                    .client
                    .create_dataset_group()
                    .name(&name)
                    .tags(Self::tenant_tag(tenant_id)?)
                    .send()
                    .await
                {
                    Ok(output) => Ok(Some(ResourceInfo {
                        name: name.clone(),
                        arn: output.dataset_group_arn().unwrap_or_default().to_string(),
                        status: "CREATING".to_string(),
                    })),
                    Err(err) if is_already_exists(&err, |e| e.is_resource_already_exists_exception()) => {
                        Ok(None)
                    }
                    Err(err) => Err(err).context("Failed to create dataset group"),
                }
            },
            self.get_dataset_group(tenant_id),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_dataset_group(&self, tenant_id: &str) -> anyhow::Result<ResourceInfo> {
        let name = self.dataset_group_name(tenant_id);

        let result = self
            .client
            .list_dataset_groups()
            .max_results(LIST_PAGE_SIZE)
            .send()
            .await
            .context("Failed to list dataset groups")?;

        result
            .dataset_groups()
            .iter()
            .find(|group| group.name() == Some(name.as_str()))
            .map(|group| ResourceInfo {
                name: name.clone(),
                arn: group.dataset_group_arn().unwrap_or_default().to_string(),
                status: group.status().unwrap_or_default().to_string(),
            })
            .with_context(|| format!("Dataset group not found for tenant '{}'", tenant_id))
            .mark_not_found()
    }

    #[tracing::instrument(skip(self), err(Display))]
    pub async fn create_dataset(
        &self,
        tenant_id: &str,
        dataset_type: &str,
        schema_arn: &str,
    ) -> anyhow::Result<ResourceInfo> {
        let dataset_group = self.get_dataset_group(tenant_id).await?;
        let name = Self::dataset_name(dataset_type, tenant_id);

        create_or_lookup(
            "dataset",
            &name,
            async {
                match self
                    .client
                    .create_dataset()
                    .name(&name)
                    .schema_arn(schema_arn)
                    .dataset_group_arn(&dataset_group.arn)
                    .dataset_type(dataset_type.to_uppercase())
                    .tags(Self::tenant_tag(tenant_id)?)
                    .send()
                    .await
                {
                    Ok(output) => Ok(Some(ResourceInfo {
                        name: name.clone(),
                        arn: output.dataset_arn().unwrap_or_default().to_string(),
                        status: "CREATING".to_string(),
                    })),
                    Err(err) if is_already_exists(&err, |e| e.is_resource_already_exists_exception()) => {
                        Ok(None)
                    }
                    Err(err) => Err(err).context("Failed to create dataset"),
                }
            },
            self.get_dataset(tenant_id, dataset_type),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_dataset(
        &self,
        tenant_id: &str,
        dataset_type: &str,
    ) -> anyhow::Result<ResourceInfo> {
        let dataset_group = self.get_dataset_group(tenant_id).await?;
        let name = Self::dataset_name(dataset_type, tenant_id);

        let result = self
            .client
            .list_datasets()
            .dataset_group_arn(&dataset_group.arn)
            .max_results(LIST_PAGE_SIZE)
            .send()
            .await
            .context("Failed to list datasets")?;

        result
            .datasets()
            .iter()
            .find(|dataset| dataset.name() == Some(name.as_str()))
            .map(|dataset| ResourceInfo {
                name: name.clone(),
                arn: dataset.dataset_arn().unwrap_or_default().to_string(),
                status: dataset.status().unwrap_or_default().to_string(),
            })
            .with_context(|| {
                format!("{} dataset not found for tenant '{}'", dataset_type, tenant_id)
            })
            .mark_not_found()
    }

    /// Starts an import job pulling a dataset from S3 into Personalize.
    #[tracing::instrument(skip(self), err(Display))]
    pub async fn create_import_job(
        &self,
        tenant_id: &str,
        dataset_arn: &str,
        s3_data_source: &str,
    ) -> anyhow::Result<ImportJobInfo> {
        let job_name = format!("import-{}-{}", tenant_id, Utc::now().timestamp());

        let output = self
            .client
            .create_dataset_import_job()
            .job_name(&job_name)
            .dataset_arn(dataset_arn)
            .data_source(DataSource::builder().data_location(s3_data_source).build())
            .role_arn(&self.role_arn)
            .tags(Self::tenant_tag(tenant_id)?)
            .send()
            .await
            .context("Failed to start dataset import job")?;

        tracing::info!("Started import job '{}' for tenant '{}'", job_name, tenant_id);

        Ok(ImportJobInfo {
            job_name,
            import_job_arn: output.dataset_import_job_arn().unwrap_or_default().to_string(),
            data_source: s3_data_source.to_string(),
            status: "CREATING".to_string(),
        })
    }

    #[tracing::instrument(skip(self), err(Display))]
    pub async fn create_solution(
        &self,
        tenant_id: &str,
        recipe_arn: &str,
    ) -> anyhow::Result<ResourceInfo> {
        let dataset_group = self.get_dataset_group(tenant_id).await?;
        let name = self.solution_name(tenant_id);

        create_or_lookup(
            "solution",
            &name,
            async {
                match self
                    .client
                    .create_solution()
                    .name(&name)
                    .dataset_group_arn(&dataset_group.arn)
                    .recipe_arn(recipe_arn)
                    .tags(Self::tenant_tag(tenant_id)?)
                    .send()
                    .await
                {
                    Ok(output) => Ok(Some(ResourceInfo {
                        name: name.clone(),
                        arn: output.solution_arn().unwrap_or_default().to_string(),
                        status: "CREATING".to_string(),
                    })),
                    Err(err) if is_already_exists(&err, |e| e.is_resource_already_exists_exception()) => {
                        Ok(None)
                    }
                    Err(err) => Err(err).context("Failed to create solution"),
                }
            },
            self.get_solution(tenant_id),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_solution(&self, tenant_id: &str) -> anyhow::Result<ResourceInfo> {
        let dataset_group = self.get_dataset_group(tenant_id).await?;
        let name = self.solution_name(tenant_id);

        let result = self
            .client
            .list_solutions()
            .dataset_group_arn(&dataset_group.arn)
            .max_results(LIST_PAGE_SIZE)
            .send()
            .await
            .context("Failed to list solutions")?;

        result
            .solutions()
            .iter()
            .find(|solution| solution.name() == Some(name.as_str()))
            .map(|solution| ResourceInfo {
                name: name.clone(),
                arn: solution.solution_arn().unwrap_or_default().to_string(),
                status: solution.status().unwrap_or_default().to_string(),
            })
            .with_context(|| format!("Solution not found for tenant '{}'", tenant_id))
            .mark_not_found()
    }

    /// Trains a new model version. The service allows several versions per
    /// solution, so there is no already-exists fallback here.
    #[tracing::instrument(skip(self), err(Display))]
    pub async fn create_solution_version(
        &self,
        tenant_id: &str,
        solution_arn: &str,
    ) -> anyhow::Result<ResourceInfo> {
        let output = self
            .client
            .create_solution_version()
            .solution_arn(solution_arn)
            .tags(Self::tenant_tag(tenant_id)?)
            .send()
            .await
            .context("Failed to create solution version")?;

        let arn = output.solution_version_arn().unwrap_or_default().to_string();
        tracing::info!("Started training solution version '{}' for tenant '{}'", arn, tenant_id);

        Ok(ResourceInfo {
            name: self.solution_name(tenant_id),
            arn,
            status: "CREATING".to_string(),
        })
    }

    #[tracing::instrument(skip(self), err(Display))]
    pub async fn create_campaign(
        &self,
        tenant_id: &str,
        solution_version_arn: &str,
        min_provisioned_tps: i32,
    ) -> anyhow::Result<ResourceInfo> {
        let name = self.campaign_name(tenant_id);

        create_or_lookup(
            "campaign",
            &name,
            async {
                match self
                    .client
                    .create_campaign()
                    .name(&name)
                    .solution_version_arn(solution_version_arn)
                    .min_provisioned_tps(min_provisioned_tps)
                    .tags(Self::tenant_tag(tenant_id)?)
                    .send()
                    .await
                {
                    Ok(output) => Ok(Some(ResourceInfo {
                        name: name.clone(),
                        arn: output.campaign_arn().unwrap_or_default().to_string(),
                        status: "CREATING".to_string(),
                    })),
                    Err(err) if is_already_exists(&err, |e| e.is_resource_already_exists_exception()) => {
                        Ok(None)
                    }
                    Err(err) => Err(err).context("Failed to create campaign"),
                }
            },
            self.get_campaign(tenant_id),
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_campaign(&self, tenant_id: &str) -> anyhow::Result<ResourceInfo> {
        let name = self.campaign_name(tenant_id);

        let result = self
            .client
            .list_campaigns()
            .max_results(LIST_PAGE_SIZE)
            .send()
            .await
            .context("Failed to list campaigns")?;

        result
            .campaigns()
            .iter()
            .find(|campaign| campaign.name() == Some(name.as_str()))
            .map(|campaign| ResourceInfo {
                name: name.clone(),
                arn: campaign.campaign_arn().unwrap_or_default().to_string(),
                status: campaign.status().unwrap_or_default().to_string(),
            })
            .with_context(|| format!("Campaign not found for tenant '{}'", tenant_id))
            .mark_not_found()
    }

    /// Fetches real-time recommendations from the tenant's campaign.
    #[tracing::instrument(level = "debug", skip(self, context), err(Display))]
    pub async fn get_recommendations(
        &self,
        campaign_arn: &str,
        user_id: &str,
        num_results: i32,
        filter_arn: Option<&str>,
        context: Option<HashMap<String, String>>,
    ) -> anyhow::Result<Vec<RecommendedItem>> {
        let result = self
            .runtime
            .get_recommendations()
            .campaign_arn(campaign_arn)
            .user_id(user_id)
            .num_results(num_results)
            .set_filter_arn(filter_arn.map(str::to_string))
            .set_context(context)
            .send()
            .await
            .with_context(|| format!("Failed to get recommendations for user '{}'", user_id))?;

        let items = result
            .item_list()
            .iter()
            .map(|item| RecommendedItem {
                item_id: item.item_id().unwrap_or_default().to_string(),
                score: item.score().unwrap_or(0.0),
            })
            .collect::<Vec<_>>();

        tracing::debug!("Retrieved {} recommendations for user '{}'", items.len(), user_id);
        Ok(items)
    }

    /// Forwards real-time interaction events to the event tracker.
    #[tracing::instrument(level = "debug", skip(self, events), err(Display))]
    pub async fn put_events(
        &self,
        tracking_id: &str,
        session_id: &str,
        user_id: &str,
        events: Vec<TrackedEvent>,
    ) -> anyhow::Result<usize> {
        let count = events.len();

        let mut request = self
            .events
            .put_events()
            .tracking_id(tracking_id)
            .session_id(session_id)
            .user_id(user_id);

        for event in events {
            let sent_at = event.sent_at.unwrap_or_else(|| Utc::now().timestamp());
            let properties = event
                .properties
                .map(|value| serde_json::to_string(&value))
                .transpose()
                .context("Failed to serialize event properties")?;

            request = request.event_list(
                aws_sdk_personalizeevents::types::Event::builder()
                    .event_type(event.event_type)
                    .set_event_id(event.event_id)
                    .set_item_id(event.item_id)
                    .set_event_value(event.event_value)
                    .set_properties(properties)
                    .sent_at(aws_sdk_personalizeevents::primitives::DateTime::from_secs(sent_at))
                    .build()
                    .context("Failed to build event")?,
            );
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to send events for user '{}'", user_id))?;

        tracing::debug!("Sent {} events for user '{}'", count, user_id);
        Ok(count)
    }

    /// Probes the three training-relevant resources and reduces their
    /// statuses to one coarse answer. A failed lookup counts as
    /// `NOT_FOUND` rather than propagating the error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_training_status(&self, tenant_id: &str) -> TrainingStatus {
        let mut components = BTreeMap::new();
        components.insert(
            "dataset_group".to_string(),
            self.status_or_not_found(self.get_dataset_group(tenant_id).await),
        );
        components.insert(
            "solution".to_string(),
            self.status_or_not_found(self.get_solution(tenant_id).await),
        );
        components.insert(
            "campaign".to_string(),
            self.status_or_not_found(self.get_campaign(tenant_id).await),
        );

        TrainingStatus {
            tenant_id: tenant_id.to_string(),
            overall_status: aggregate_overall_status(components.values().map(String::as_str)),
            components,
        }
    }

    fn status_or_not_found(&self, result: anyhow::Result<ResourceInfo>) -> String {
        result
            .map(|resource| resource.status)
            .unwrap_or_else(|_| "NOT_FOUND".to_string())
    }
}

/// The create / on-already-exists-lookup idiom shared by all resource
/// kinds. `create` resolves to `Ok(None)` when the service reported the
/// resource as already existing.
async fn create_or_lookup<T>(
    resource: &str,
    name: &str,
    create: impl Future<Output = anyhow::Result<Option<T>>>,
    lookup: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match create.await? {
        Some(created) => {
            tracing::info!("Created {} '{}'", resource, name);
            Ok(created)
        }
        None => {
            tracing::info!("{} '{}' already exists. Looking it up...", resource, name);
            lookup
                .await
                .with_context(|| format!("Failed to look up existing {} '{}'", resource, name))
        }
    }
}

fn is_already_exists<E, R>(err: &aws_sdk_personalize::error::SdkError<E, R>, check: impl Fn(&E) -> bool) -> bool {
    err.as_service_error().map(check).unwrap_or(false)
}

/// Reduces component statuses by ordered precedence: anything still being
/// created wins over everything else, then all-active, then any failure.
pub fn aggregate_overall_status<'a>(
    statuses: impl IntoIterator<Item = &'a str>,
) -> OverallStatus {
    let statuses: Vec<&str> = statuses.into_iter().collect();

    if statuses
        .iter()
        .any(|status| *status == "CREATING" || *status == "CREATE_IN_PROGRESS")
    {
        OverallStatus::Training
    } else if statuses.iter().all(|status| *status == "ACTIVE") {
        OverallStatus::Ready
    } else if statuses
        .iter()
        .any(|status| *status == "FAILED" || *status == "CREATE_FAILED")
    {
        OverallStatus::Failed
    } else {
        OverallStatus::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_only_when_all_components_are_active() {
        assert_eq!(
            aggregate_overall_status(["ACTIVE", "ACTIVE", "ACTIVE"]),
            OverallStatus::Ready
        );
        assert_eq!(
            aggregate_overall_status(["ACTIVE", "ACTIVE", "NOT_FOUND"]),
            OverallStatus::Incomplete
        );
    }

    #[test]
    fn any_creating_component_means_training() {
        assert_eq!(
            aggregate_overall_status(["CREATING", "ACTIVE", "ACTIVE"]),
            OverallStatus::Training
        );
        assert_eq!(
            aggregate_overall_status(["ACTIVE", "CREATE_IN_PROGRESS", "NOT_FOUND"]),
            OverallStatus::Training
        );
    }

    #[test]
    fn training_takes_precedence_over_a_simultaneous_failure() {
        assert_eq!(
            aggregate_overall_status(["CREATING", "FAILED", "ACTIVE"]),
            OverallStatus::Training
        );
    }

    #[test]
    fn any_failed_component_without_creation_means_failed() {
        assert_eq!(
            aggregate_overall_status(["ACTIVE", "CREATE_FAILED", "ACTIVE"]),
            OverallStatus::Failed
        );
        assert_eq!(
            aggregate_overall_status(["FAILED", "NOT_FOUND", "ACTIVE"]),
            OverallStatus::Failed
        );
    }

    #[test]
    fn all_missing_components_are_incomplete() {
        assert_eq!(
            aggregate_overall_status(["NOT_FOUND", "NOT_FOUND", "NOT_FOUND"]),
            OverallStatus::Incomplete
        );
    }

    #[test]
    fn overall_status_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&OverallStatus::Training).unwrap(),
            "\"TRAINING\""
        );
        assert_eq!(serde_json::to_string(&OverallStatus::Ready).unwrap(), "\"READY\"");
    }

    #[test]
    fn derived_names_are_stable_per_tenant() {
        let settings = test_settings();
        let sdk_config = aws_config::SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .build();
        let client = PersonalizeClient::new(&sdk_config, &settings);

        assert_eq!(client.dataset_group_name("t1"), "retail-t1");
        assert_eq!(client.dataset_group_name("t1"), client.dataset_group_name("t1"));
        assert_eq!(client.solution_name("t1"), "retail-recommendations-t1");
        assert_eq!(client.campaign_name("t1"), "retail-campaign-t1");
        assert_eq!(PersonalizeClient::dataset_name("INTERACTIONS", "t1"), "interactions-t1");
    }

    fn test_settings() -> crate::config::Settings {
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

        crate::config::Settings::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap()
    }
}
