//! Tenant-scoped persistence: the recommendation cache, user profiles and
//! campaign tracking.
//!
//! The cache uses lazy expiry: a read past the TTL deletes the row and
//! reports a miss. Both the read-side delete and the store's own TTL sweep
//! are idempotent, so they may race freely. Campaign events are append-only
//! with a 90-day TTL handled by the table itself.

use crate::aws::dynamodb::client::DynamoClient;
use crate::aws::dynamodb::convert;
use crate::config::Settings;
use crate::tools::ids;
use anyhow::Context;
use aws_sdk_dynamodb::types::{AttributeValue, Select};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

const FIELD_TENANT_ID: &str = "tenant_id";
const FIELD_USER_ID: &str = "user_id";
const FIELD_EVENT_ID: &str = "event_id";
const FIELD_CAMPAIGN_ID: &str = "campaign_id";
const FIELD_EVENT_TYPE: &str = "event_type";
const FIELD_EVENT_DATA: &str = "event_data";
const FIELD_RECOMMENDATIONS: &str = "recommendations";
const FIELD_PROFILE_DATA: &str = "profile_data";
const FIELD_CACHED_AT: &str = "cached_at";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_UPDATED_AT: &str = "updated_at";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_TTL: &str = "ttl";

const INDEX_CAMPAIGN: &str = "campaign-index";
const INDEX_USER: &str = "user-index";

const EVENT_RETENTION_DAYS: i64 = 90;
const EVENT_ID_SUFFIX_LENGTH: usize = 6;

#[derive(Clone, Debug)]
pub struct PersonalizationStore {
    client: DynamoClient,
    recommendations_table: String,
    user_profiles_table: String,
    campaign_tracking_table: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecommendedItem {
    pub item_id: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub profile_data: Value,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CampaignEvent {
    pub event_id: String,
    pub campaign_id: String,
    pub user_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct CampaignMetrics {
    pub campaign_id: String,
    pub total_events: u64,
    pub unique_users: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub click_through_rate: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub recommendations: u64,
    /// Event rows past their TTL. Deletion of these is handled by the
    /// store's own asynchronous sweep, so this count may overstate what is
    /// actually removed right now.
    pub campaign_events: u64,
}

impl PersonalizationStore {
    pub fn new(client: DynamoClient, settings: &Settings) -> PersonalizationStore {
        PersonalizationStore {
            client,
            recommendations_table: settings.recommendations_table.clone(),
            user_profiles_table: settings.user_profiles_table.clone(),
            campaign_tracking_table: settings.campaign_tracking_table.clone(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, items), err(Display))]
    pub async fn cache_recommendations(
        &self,
        tenant_id: &str,
        user_id: &str,
        items: &[RecommendedItem],
        ttl_hours: i64,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let recommendations = convert::to_attribute_value(
            &serde_json::to_value(items).context("Failed to encode recommendations")?,
        )?;

        self.client
            .put_item(&self.recommendations_table)
            .item(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .item(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .item(FIELD_RECOMMENDATIONS, recommendations)
            .item(FIELD_CACHED_AT, AttributeValue::S(now.to_rfc3339()))
            .item(
                FIELD_TTL,
                AttributeValue::N(expiry_timestamp(now.timestamp(), ttl_hours).to_string()),
            )
            .send()
            .await
            .with_context(|| format!("Failed to cache recommendations for user '{}'", user_id))?;

        tracing::debug!(
            "Cached {} recommendations for user '{}' in tenant '{}'",
            items.len(),
            user_id,
            tenant_id
        );
        Ok(())
    }

    /// Returns the cached recommendations, or `None` if nothing was cached
    /// or the entry has expired. An expired entry is deleted on the way out.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_cached_recommendations(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<Vec<RecommendedItem>>> {
        let result = self
            .client
            .get_item(&self.recommendations_table)
            .key(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .key(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .send()
            .await
            .with_context(|| format!("Failed to read cached recommendations for '{}'", user_id))?;

        let Some(item) = result.item else {
            return Ok(None);
        };

        let ttl = numeric_attribute(&item, FIELD_TTL).unwrap_or(0);
        if is_expired(ttl, Utc::now().timestamp()) {
            tracing::debug!("Cached recommendations expired for user '{}'", user_id);
            self.invalidate_recommendations(tenant_id, user_id).await?;
            return Ok(None);
        }

        let recommendations = item
            .get(FIELD_RECOMMENDATIONS)
            .context("Cache row has no recommendations attribute")?;
        let items: Vec<RecommendedItem> =
            serde_json::from_value(convert::from_attribute_value(recommendations)?)
                .context("Failed to decode cached recommendations")?;

        Ok(Some(items))
    }

    /// Deletes the cache row. A no-op when the row is already gone.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn invalidate_recommendations(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> anyhow::Result<()> {
        self.client
            .delete_item(&self.recommendations_table)
            .key(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .key(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .send()
            .await
            .with_context(|| format!("Failed to invalidate cache for user '{}'", user_id))?;

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, profile_data), err(Display))]
    pub async fn put_user_profile(
        &self,
        tenant_id: &str,
        user_id: &str,
        profile_data: &Value,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        self.client
            .put_item(&self.user_profiles_table)
            .item(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .item(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .item(FIELD_PROFILE_DATA, convert::to_attribute_value(profile_data)?)
            .item(FIELD_CREATED_AT, AttributeValue::S(now.clone()))
            .item(FIELD_UPDATED_AT, AttributeValue::S(now))
            .send()
            .await
            .with_context(|| format!("Failed to store profile for user '{}'", user_id))?;

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_user_profile(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<UserProfile>> {
        let result = self
            .client
            .get_item(&self.user_profiles_table)
            .key(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .key(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .send()
            .await
            .with_context(|| format!("Failed to read profile for user '{}'", user_id))?;

        let Some(item) = result.item else {
            return Ok(None);
        };

        let profile_data = item
            .get(FIELD_PROFILE_DATA)
            .map(convert::from_attribute_value)
            .transpose()?
            .unwrap_or_else(|| Value::Object(Default::default()));

        Ok(Some(UserProfile {
            user_id: user_id.to_string(),
            profile_data,
            created_at: string_attribute(&item, FIELD_CREATED_AT),
            updated_at: string_attribute(&item, FIELD_UPDATED_AT),
        }))
    }

    /// Updates individual profile fields, leaving the rest of the profile
    /// untouched. Also bumps `updated_at`.
    #[tracing::instrument(level = "debug", skip(self, updates), err(Display))]
    pub async fn merge_user_profile(
        &self,
        tenant_id: &str,
        user_id: &str,
        updates: &serde_json::Map<String, Value>,
    ) -> anyhow::Result<()> {
        let mut update_expression = String::from("SET #updated_at = :updated_at");
        let mut request = self
            .client
            .update_item(&self.user_profiles_table)
            .key(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .key(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .expression_attribute_names("#updated_at", FIELD_UPDATED_AT)
            .expression_attribute_values(
                ":updated_at",
                AttributeValue::S(Utc::now().to_rfc3339()),
            );

        if !updates.is_empty() {
            request = request.expression_attribute_names("#profile_data", FIELD_PROFILE_DATA);
        }

        for (index, (field, value)) in updates.iter().enumerate() {
            update_expression.push_str(&format!(", #profile_data.#f{0} = :v{0}", index));
            request = request
                .expression_attribute_names(format!("#f{}", index), field)
                .expression_attribute_values(
                    format!(":v{}", index),
                    convert::to_attribute_value(value)?,
                );
        }

        request
            .update_expression(update_expression)
            .send()
            .await
            .with_context(|| format!("Failed to update profile for user '{}'", user_id))?;

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn list_user_profiles(
        &self,
        tenant_id: &str,
        limit: i32,
    ) -> anyhow::Result<Vec<ProfileSummary>> {
        DynamoClient::query_page::<ProfileSummary>(
            self.client
                .query(&self.user_profiles_table)
                .limit(limit)
                .key_condition_expression("#tenant_id = :tenant_id")
                .expression_attribute_names("#tenant_id", FIELD_TENANT_ID)
                .expression_attribute_values(
                    ":tenant_id",
                    AttributeValue::S(tenant_id.to_string()),
                ),
        )
        .await
        .with_context(|| format!("Failed to list profiles for tenant '{}'", tenant_id))
    }

    /// Appends a campaign tracking event and returns its id. The id keeps
    /// the time-ordered `{campaign}#{user}#{unix_secs}` prefix and appends a
    /// random suffix, so two events within the same second never collide.
    #[tracing::instrument(level = "debug", skip(self, event_data), err(Display))]
    pub async fn track_campaign_event(
        &self,
        tenant_id: &str,
        campaign_id: &str,
        user_id: &str,
        event_type: &str,
        event_data: &Value,
    ) -> anyhow::Result<String> {
        let now = Utc::now();
        let event_id = compose_event_id(
            campaign_id,
            user_id,
            now.timestamp(),
            &ids::generate_id(EVENT_ID_SUFFIX_LENGTH),
        );
        let retention = now.timestamp() + EVENT_RETENTION_DAYS * 24 * 3600;

        self.client
            .put_item(&self.campaign_tracking_table)
            .item(FIELD_TENANT_ID, AttributeValue::S(tenant_id.to_string()))
            .item(FIELD_EVENT_ID, AttributeValue::S(event_id.clone()))
            .item(FIELD_CAMPAIGN_ID, AttributeValue::S(campaign_id.to_string()))
            .item(FIELD_USER_ID, AttributeValue::S(user_id.to_string()))
            .item(FIELD_EVENT_TYPE, AttributeValue::S(event_type.to_string()))
            .item(FIELD_EVENT_DATA, convert::to_attribute_value(event_data)?)
            .item(FIELD_TIMESTAMP, AttributeValue::S(now.to_rfc3339()))
            .item(FIELD_TTL, AttributeValue::N(retention.to_string()))
            .send()
            .await
            .with_context(|| {
                format!("Failed to track '{}' event for campaign '{}'", event_type, campaign_id)
            })?;

        Ok(event_id)
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_campaign_metrics(
        &self,
        tenant_id: &str,
        campaign_id: &str,
    ) -> anyhow::Result<CampaignMetrics> {
        #[derive(Serialize, Deserialize)]
        struct EventRow {
            event_type: String,
            user_id: String,
        }

        let events = DynamoClient::query_all::<EventRow>(
            self.client
                .query(&self.campaign_tracking_table)
                .index_name(INDEX_CAMPAIGN)
                .key_condition_expression("#tenant_id = :tenant_id AND #campaign_id = :campaign_id")
                .expression_attribute_names("#tenant_id", FIELD_TENANT_ID)
                .expression_attribute_names("#campaign_id", FIELD_CAMPAIGN_ID)
                .expression_attribute_values(":tenant_id", AttributeValue::S(tenant_id.to_string()))
                .expression_attribute_values(
                    ":campaign_id",
                    AttributeValue::S(campaign_id.to_string()),
                ),
        )
        .await
        .with_context(|| format!("Failed to read events for campaign '{}'", campaign_id))?;

        Ok(compute_metrics(
            campaign_id,
            events.iter().map(|row| (row.event_type.as_str(), row.user_id.as_str())),
        ))
    }

    /// Campaign events for one user, most recent first.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_user_campaign_history(
        &self,
        tenant_id: &str,
        user_id: &str,
        limit: i32,
    ) -> anyhow::Result<Vec<CampaignEvent>> {
        let result = self
            .client
            .query(&self.campaign_tracking_table)
            .index_name(INDEX_USER)
            .limit(limit)
            .scan_index_forward(false)
            .key_condition_expression("#tenant_id = :tenant_id AND #user_id = :user_id")
            .expression_attribute_names("#tenant_id", FIELD_TENANT_ID)
            .expression_attribute_names("#user_id", FIELD_USER_ID)
            .expression_attribute_values(":tenant_id", AttributeValue::S(tenant_id.to_string()))
            .expression_attribute_values(":user_id", AttributeValue::S(user_id.to_string()))
            .send()
            .await
            .with_context(|| format!("Failed to read campaign history for user '{}'", user_id))?;

        result
            .items
            .unwrap_or_default()
            .iter()
            .map(|item| {
                Ok(CampaignEvent {
                    event_id: required_string_attribute(item, FIELD_EVENT_ID)?,
                    campaign_id: required_string_attribute(item, FIELD_CAMPAIGN_ID)?,
                    user_id: user_id.to_string(),
                    event_type: required_string_attribute(item, FIELD_EVENT_TYPE)?,
                    event_data: item
                        .get(FIELD_EVENT_DATA)
                        .map(convert::from_attribute_value)
                        .transpose()?
                        .unwrap_or(Value::Null),
                    timestamp: string_attribute(item, FIELD_TIMESTAMP).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Deletes expired recommendation rows and reports how many event rows
    /// are past their TTL. Event deletion itself is left to the table's TTL
    /// sweep.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn cleanup_expired_items(&self, tenant_id: &str) -> anyhow::Result<CleanupReport> {
        #[derive(Serialize, Deserialize)]
        struct CacheRowKey {
            tenant_id: String,
            user_id: String,
        }

        let now = Utc::now().timestamp();

        let expired = DynamoClient::query_all::<CacheRowKey>(
            self.client
                .query(&self.recommendations_table)
                .key_condition_expression("#tenant_id = :tenant_id")
                .filter_expression("#ttl <= :now")
                .expression_attribute_names("#tenant_id", FIELD_TENANT_ID)
                .expression_attribute_names("#ttl", FIELD_TTL)
                .expression_attribute_values(":tenant_id", AttributeValue::S(tenant_id.to_string()))
                .expression_attribute_values(":now", AttributeValue::N(now.to_string())),
        )
        .await
        .context("Failed to scan for expired cache rows")?;

        for row in &expired {
            self.invalidate_recommendations(&row.tenant_id, &row.user_id)
                .await?;
        }

        let mut expired_events: u64 = 0;
        let mut last_key = None;
        loop {
            let result = self
                .client
                .query(&self.campaign_tracking_table)
                .select(Select::Count)
                .key_condition_expression("#tenant_id = :tenant_id")
                .filter_expression("#ttl <= :now")
                .expression_attribute_names("#tenant_id", FIELD_TENANT_ID)
                .expression_attribute_names("#ttl", FIELD_TTL)
                .expression_attribute_values(":tenant_id", AttributeValue::S(tenant_id.to_string()))
                .expression_attribute_values(":now", AttributeValue::N(now.to_string()))
                .set_exclusive_start_key(last_key)
                .send()
                .await
                .context("Failed to count expired campaign events")?;

            expired_events += result.count() as u64;
            match result.last_evaluated_key {
                Some(next_key) => last_key = Some(next_key),
                None => break,
            }
        }

        let report = CleanupReport {
            recommendations: expired.len() as u64,
            campaign_events: expired_events,
        };
        tracing::info!(
            "Cleaned up {} cache rows for tenant '{}' ({} expired events pending store sweep)",
            report.recommendations,
            tenant_id,
            report.campaign_events
        );

        Ok(report)
    }
}

fn expiry_timestamp(now: i64, ttl_hours: i64) -> i64 {
    now + ttl_hours * 3600
}

fn is_expired(ttl: i64, now: i64) -> bool {
    ttl <= now
}

fn compose_event_id(campaign_id: &str, user_id: &str, unix_secs: i64, suffix: &str) -> String {
    format!("{}#{}#{}#{}", campaign_id, user_id, unix_secs, suffix)
}

fn compute_metrics<'a>(
    campaign_id: &str,
    events: impl Iterator<Item = (&'a str, &'a str)>,
) -> CampaignMetrics {
    let mut events_by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut unique_users = HashSet::new();
    let mut total_events = 0;

    for (event_type, user_id) in events {
        total_events += 1;
        unique_users.insert(user_id.to_string());
        *events_by_type.entry(event_type.to_string()).or_default() += 1;
    }

    let sent = events_by_type.get("sent").copied().unwrap_or(0);
    let clicked = events_by_type.get("clicked").copied().unwrap_or(0);
    let converted = events_by_type.get("converted").copied().unwrap_or(0);

    // sent == 0 would divide by zero; both rates are defined as 0.0 then.
    let (click_through_rate, conversion_rate) = if sent > 0 {
        (
            clicked as f64 / sent as f64 * 100.0,
            converted as f64 / sent as f64 * 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    CampaignMetrics {
        campaign_id: campaign_id.to_string(),
        total_events,
        unique_users: unique_users.len() as u64,
        events_by_type,
        click_through_rate,
        conversion_rate,
    }
}

fn string_attribute(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .map(|value| value.to_string())
}

fn required_string_attribute(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> anyhow::Result<String> {
    string_attribute(item, name).with_context(|| format!("Row has no '{}' attribute", name))
}

fn numeric_attribute(item: &HashMap<String, AttributeValue>, name: &str) -> Option<i64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_timestamp_adds_whole_hours() {
        assert_eq!(expiry_timestamp(1_000, 1), 4_600);
        assert_eq!(expiry_timestamp(1_000, 24), 1_000 + 86_400);
    }

    #[test]
    fn entries_expire_once_the_ttl_is_reached() {
        assert!(!is_expired(1_001, 1_000));
        assert!(is_expired(1_000, 1_000));
        assert!(is_expired(999, 1_000));
    }

    #[test]
    fn event_ids_keep_the_time_ordered_prefix() {
        let id = compose_event_id("summer-sale", "user-1", 1_700_000_000, "X7Q2MD");
        assert_eq!(id, "summer-sale#user-1#1700000000#X7Q2MD");
    }

    #[test]
    fn event_ids_differ_within_the_same_second() {
        let first = compose_event_id("c", "u", 1_700_000_000, &ids::generate_id(6));
        let second = compose_event_id("c", "u", 1_700_000_000, &ids::generate_id(6));
        assert_ne!(first, second);
    }

    #[test]
    fn metrics_compute_rates_from_sent_events() {
        let events = [
            vec![("sent", "u1"); 10],
            vec![("clicked", "u2"); 3],
            vec![("converted", "u3"); 1],
        ]
        .concat();

        let metrics = compute_metrics("summer-sale", events.into_iter());

        assert_eq!(metrics.total_events, 14);
        assert_eq!(metrics.unique_users, 3);
        assert_eq!(metrics.events_by_type.get("sent"), Some(&10));
        assert_eq!(metrics.click_through_rate, 30.0);
        assert_eq!(metrics.conversion_rate, 10.0);
    }

    #[test]
    fn metrics_with_no_sent_events_have_zero_rates() {
        let events = vec![("clicked", "u1"), ("converted", "u1")];

        let metrics = compute_metrics("quiet-campaign", events.into_iter());

        assert_eq!(metrics.click_through_rate, 0.0);
        assert_eq!(metrics.conversion_rate, 0.0);
        assert_eq!(metrics.total_events, 2);
        assert_eq!(metrics.unique_users, 1);
    }

    #[test]
    fn metrics_of_an_empty_event_list_are_all_zero() {
        let metrics = compute_metrics("no-events", std::iter::empty());

        assert_eq!(metrics.total_events, 0);
        assert_eq!(metrics.unique_users, 0);
        assert!(metrics.events_by_type.is_empty());
        assert_eq!(metrics.click_through_rate, 0.0);
        assert_eq!(metrics.conversion_rate, 0.0);
    }

    #[test]
    fn recommendations_survive_the_numeric_layer() {
        let items = vec![
            RecommendedItem {
                item_id: "sku-1".to_string(),
                score: 0.9127364,
            },
            RecommendedItem {
                item_id: "sku-2".to_string(),
                score: 0.30000000000000004,
            },
        ];

        let encoded =
            convert::to_attribute_value(&serde_json::to_value(&items).unwrap()).unwrap();
        let decoded: Vec<RecommendedItem> =
            serde_json::from_value(convert::from_attribute_value(&encoded).unwrap()).unwrap();

        assert_eq!(decoded, items);
    }
}
