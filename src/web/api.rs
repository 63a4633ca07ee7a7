//! The HTTP surface.
//!
//! Every route validates the API key and tenant header, then delegates to
//! exactly one adapter (the status and metrics routes merge a handful of
//! adapter calls). All handlers reply JSON; errors are mapped through
//! [`crate::web::error::ApiError`].

use crate::aws::dynamodb::PersonalizationStore;
use crate::aws::personalize::{PersonalizeClient, TrackedEvent};
use crate::aws::pinpoint::{Channel, PinpointClient};
use crate::aws::s3::{DatasetKind, S3Client, UploadBody};
use crate::aws::sfn::WorkflowClient;
use crate::config::Settings;
use crate::tools::ids;
use crate::{client_bail, routes};
use crate::web::auth::with_tenant;
use crate::web::error::ResultExt;
use crate::web::validation::{validate_id, validate_str};
use crate::web::warp::{
    content_length_header, decode_json, into_rejection, into_response, with_cloneable,
};
use crate::web::{DEFAULT_MAX_JSON_BODY_SIZE, DEFAULT_MAX_UPLOAD_SIZE};
use anyhow::Context;
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::bytes::BufMut;
use warp::filters::BoxedFilter;
use warp::multipart::{FormData, Part};
use warp::{Filter, Rejection, Reply};

const DEFAULT_RECOMMENDATION_LIMIT: i32 = 20;
const DEFAULT_CACHE_TTL_HOURS: i64 = 24;
const DEFAULT_HISTORY_LIMIT: i32 = 50;
const DEFAULT_PROFILE_LIMIT: i32 = 100;
const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;

/// All adapters, constructed once at startup and injected into every
/// request handler.
#[derive(Clone)]
pub struct Services {
    pub settings: Arc<Settings>,
    pub s3: S3Client,
    pub store: PersonalizationStore,
    pub personalize: PersonalizeClient,
    pub pinpoint: PinpointClient,
    pub workflows: WorkflowClient,
}

pub fn api_routes(services: Services) -> BoxedFilter<(impl Reply,)> {
    routes![
        health_route(),
        upload_route(services.clone()),
        train_route(services.clone()),
        recommendations_route(services.clone()),
        invalidate_recommendations_route(services.clone()),
        campaign_route(services.clone()),
        status_route(services.clone()),
        metrics_route(services.clone()),
        track_route(services.clone()),
        history_route(services.clone()),
        put_profile_route(services.clone()),
        get_profile_route(services.clone()),
        merge_profile_route(services.clone()),
        list_profiles_route(services.clone()),
        list_files_route(services.clone()),
        delete_file_route(services.clone()),
        presign_file_route(services.clone()),
        file_metadata_route(services.clone()),
        events_route(services.clone()),
        notify_route(services.clone()),
        cleanup_route(services.clone()),
        endpoints_route(services)
    ]
    .boxed()
}

fn authenticated(
    services: &Services,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone + use<> {
    with_tenant(services.settings.clone())
}

fn json_body<T: DeserializeOwned + Send>()
-> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    content_length_header()
        .and(warp::body::stream())
        .and_then(|content_length, body| async move {
            decode_json(body, content_length, DEFAULT_MAX_JSON_BODY_SIZE as i64)
                .await
                .map_err(into_rejection)
        })
}

// --- GET /health --------------------------------------------------------

fn health_route() -> BoxedFilter<(impl Reply,)> {
    warp::path!("health")
        .and(warp::get())
        .and_then(handle_health)
        .boxed()
}

#[tracing::instrument(level = "debug", name = "GET /health", skip_all)]
async fn handle_health() -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": crate::APP_VERSION.clone(),
        "services": {
            "s3": "configured",
            "dynamodb": "configured",
            "personalize": "configured",
            "pinpoint": "configured",
            "stepfunctions": "configured",
        },
    })))
}

// --- POST /upload -------------------------------------------------------

#[derive(Deserialize)]
struct UploadQuery {
    dataset_type: Option<String>,
}

fn upload_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("upload")
        .and(warp::post())
        .and(authenticated(&services))
        .and(warp::query::<UploadQuery>())
        .and(warp::multipart::form().max_length(DEFAULT_MAX_UPLOAD_SIZE))
        .and(with_cloneable(services))
        .and_then(handle_upload)
        .boxed()
}

#[tracing::instrument(name = "POST /upload", skip_all)]
async fn handle_upload(
    tenant_id: String,
    query: UploadQuery,
    form: FormData,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_upload(tenant_id, query, form, services).await)
}

async fn perform_upload(
    tenant_id: String,
    query: UploadQuery,
    form: FormData,
    services: Services,
) -> anyhow::Result<Value> {
    let dataset_type: DatasetKind = query
        .dataset_type
        .as_deref()
        .unwrap_or("interactions")
        .parse()?;

    let mut form = pin!(form);
    while let Some(part) = form
        .try_next()
        .await
        .context("Failed to read multipart body")
        .mark_client_error()?
    {
        if part.name() != "file" {
            continue;
        }

        let filename = part
            .filename()
            .map(str::to_string)
            .context("The file part carries no filename")
            .mark_client_error()?;
        validate_csv_filename(&filename)?;

        let data = read_part(part).await?;
        let key = format!("datasets/{}/{}", dataset_type.as_str(), filename);
        let metadata = HashMap::from([(
            "dataset_type".to_string(),
            dataset_type.as_str().to_string(),
        )]);

        let info = services
            .s3
            .upload(&tenant_id, &key, UploadBody::Bytes(data), "text/csv", Some(metadata))
            .await?;

        return Ok(json!({
            "message": "Dataset uploaded successfully",
            "s3_url": info.url,
            "key": info.key,
            "size": info.size,
            "dataset_type": dataset_type.as_str(),
            "tenant_id": tenant_id,
            "filename": filename,
        }));
    }

    client_bail!("No 'file' part present in the upload")
}

fn validate_csv_filename(filename: &str) -> anyhow::Result<()> {
    if !filename.ends_with(".csv") {
        client_bail!("Only CSV files are supported");
    }
    Ok(())
}

async fn read_part(part: Part) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut stream = pin!(part.stream());
    while let Some(chunk) = stream
        .try_next()
        .await
        .context("Failed to read uploaded file")
        .mark_client_error()?
    {
        data.put(chunk);
    }

    Ok(data)
}

// --- POST /train --------------------------------------------------------

#[derive(Deserialize)]
struct TrainRequest {
    dataset_location: Option<String>,
}

fn train_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("train")
        .and(warp::post())
        .and(authenticated(&services))
        .and(json_body::<TrainRequest>())
        .and(with_cloneable(services))
        .and_then(handle_train)
        .boxed()
}

#[tracing::instrument(name = "POST /train", skip_all)]
async fn handle_train(
    tenant_id: String,
    request: TrainRequest,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_train(tenant_id, request, services).await)
}

async fn perform_train(
    tenant_id: String,
    request: TrainRequest,
    services: Services,
) -> anyhow::Result<Value> {
    let dataset_location = request.dataset_location.unwrap_or_else(|| {
        default_dataset_location(&services.settings.s3_bucket_name, &tenant_id)
    });

    let execution = services
        .workflows
        .start_training_workflow(&tenant_id, &dataset_location)
        .await?;

    Ok(json!({
        "message": "Model training started",
        "execution_arn": execution.execution_arn,
        "tenant_id": tenant_id,
        "dataset_location": dataset_location,
        "status": execution.status,
    }))
}

fn default_dataset_location(bucket: &str, tenant_id: &str) -> String {
    format!(
        "s3://{}/{}/datasets/interactions/interactions.csv",
        bucket, tenant_id
    )
}

// --- GET /recommendations -----------------------------------------------

#[derive(Deserialize)]
struct RecommendationsQuery {
    user_id: String,
    limit: Option<i32>,
    category: Option<String>,
}

fn recommendations_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("recommendations")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<RecommendationsQuery>())
        .and(with_cloneable(services))
        .and_then(handle_recommendations)
        .boxed()
}

#[tracing::instrument(name = "GET /recommendations", skip_all)]
async fn handle_recommendations(
    tenant_id: String,
    query: RecommendationsQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_recommendations(tenant_id, query, services).await)
}

async fn perform_recommendations(
    tenant_id: String,
    query: RecommendationsQuery,
    services: Services,
) -> anyhow::Result<Value> {
    let user_id = validate_id("user_id", query.user_id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECOMMENDATION_LIMIT)
        .clamp(1, 100);

    if let Some(cached) = services
        .store
        .get_cached_recommendations(&tenant_id, &user_id)
        .await?
    {
        return Ok(json!({
            "user_id": user_id,
            "tenant_id": tenant_id,
            "recommendations": cached,
            "limit": limit,
            "category": query.category,
            "source": "cache",
        }));
    }

    let campaign = services.personalize.get_campaign(&tenant_id).await?;
    let context = query
        .category
        .as_ref()
        .map(|category| HashMap::from([("CATEGORY".to_string(), category.clone())]));

    let items = services
        .personalize
        .get_recommendations(&campaign.arn, &user_id, limit, None, context)
        .await?;

    services
        .store
        .cache_recommendations(&tenant_id, &user_id, &items, DEFAULT_CACHE_TTL_HOURS)
        .await?;

    Ok(json!({
        "user_id": user_id,
        "tenant_id": tenant_id,
        "recommendations": items,
        "limit": limit,
        "category": query.category,
        "source": "campaign",
    }))
}

// --- DELETE /recommendations --------------------------------------------

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

fn invalidate_recommendations_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("recommendations")
        .and(warp::delete())
        .and(authenticated(&services))
        .and(warp::query::<UserQuery>())
        .and(with_cloneable(services))
        .and_then(handle_invalidate_recommendations)
        .boxed()
}

#[tracing::instrument(name = "DELETE /recommendations", skip_all)]
async fn handle_invalidate_recommendations(
    tenant_id: String,
    query: UserQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let user_id = validate_id("user_id", query.user_id)?;
        services
            .store
            .invalidate_recommendations(&tenant_id, &user_id)
            .await?;

        Ok(json!({ "message": "Recommendations cache invalidated", "user_id": user_id }))
    }
    .await)
}

// --- POST /campaign -----------------------------------------------------

#[derive(Deserialize)]
struct CampaignRequest {
    user_ids: Vec<String>,
    message: String,
    subject: Option<String>,
    channel: Option<String>,
}

fn campaign_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("campaign")
        .and(warp::post())
        .and(authenticated(&services))
        .and(json_body::<CampaignRequest>())
        .and(with_cloneable(services))
        .and_then(handle_campaign)
        .boxed()
}

#[tracing::instrument(name = "POST /campaign", skip_all)]
async fn handle_campaign(
    tenant_id: String,
    request: CampaignRequest,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_campaign(tenant_id, request, services).await)
}

async fn perform_campaign(
    tenant_id: String,
    request: CampaignRequest,
    services: Services,
) -> anyhow::Result<Value> {
    let channel: Channel = request.channel.as_deref().unwrap_or("email").parse()?;
    if request.user_ids.is_empty() {
        client_bail!("At least one user id is required");
    }
    let message = validate_str("message", request.message, 1, 10_000)?;

    let campaign_name = format!("campaign-{}", ids::generate_id(8));
    let segment = services
        .pinpoint
        .create_segment(&tenant_id, &campaign_name, &request.user_ids)
        .await?;

    let campaign = match channel {
        Channel::Email => {
            let subject = validate_str(
                "subject",
                request.subject.context("'subject' is required for email campaigns").mark_client_error()?,
                1,
                256,
            )?;
            services
                .pinpoint
                .send_email_campaign(
                    &tenant_id,
                    &campaign_name,
                    &segment.segment_id,
                    &subject,
                    &message,
                    Some(&message),
                )
                .await?
        }
        Channel::Sms => {
            services
                .pinpoint
                .send_sms_campaign(&tenant_id, &campaign_name, &segment.segment_id, &message)
                .await?
        }
    };

    for user_id in &request.user_ids {
        services
            .store
            .track_campaign_event(
                &tenant_id,
                &campaign.campaign_id,
                user_id,
                "sent",
                &json!({ "channel": channel }),
            )
            .await?;
    }

    Ok(json!({
        "message": "Campaign sent successfully",
        "campaign_id": campaign.campaign_id,
        "segment_id": segment.segment_id,
        "tenant_id": tenant_id,
        "user_count": request.user_ids.len(),
        "channel": channel,
    }))
}

// --- GET /status --------------------------------------------------------

#[derive(Deserialize)]
struct StatusQuery {
    execution_arn: Option<String>,
}

fn status_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("status")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<StatusQuery>())
        .and(with_cloneable(services))
        .and_then(handle_status)
        .boxed()
}

#[tracing::instrument(name = "GET /status", skip_all)]
async fn handle_status(
    tenant_id: String,
    query: StatusQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_status(tenant_id, query, services).await)
}

async fn perform_status(
    tenant_id: String,
    query: StatusQuery,
    services: Services,
) -> anyhow::Result<Value> {
    let mut status = json!({
        "tenant_id": tenant_id,
        "timestamp": Utc::now().to_rfc3339(),
    });

    if let Some(execution_arn) = query.execution_arn {
        let workflow = services.workflows.get_execution_status(&execution_arn).await?;
        status["workflow"] = serde_json::to_value(workflow)?;
    }

    let training = services.personalize.get_training_status(&tenant_id).await;
    status["training"] = serde_json::to_value(training)?;

    let campaigns = services.pinpoint.list_campaigns(&tenant_id).await?;
    status["campaigns"] = serde_json::to_value(campaigns)?;

    Ok(status)
}

// --- GET /metrics -------------------------------------------------------

#[derive(Deserialize)]
struct MetricsQuery {
    campaign_id: Option<String>,
}

fn metrics_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("metrics")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<MetricsQuery>())
        .and(with_cloneable(services))
        .and_then(handle_metrics)
        .boxed()
}

#[tracing::instrument(name = "GET /metrics", skip_all)]
async fn handle_metrics(
    tenant_id: String,
    query: MetricsQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_metrics(tenant_id, query, services).await)
}

async fn perform_metrics(
    tenant_id: String,
    query: MetricsQuery,
    services: Services,
) -> anyhow::Result<Value> {
    let timestamp = Utc::now().to_rfc3339();

    if let Some(campaign_id) = query.campaign_id {
        let campaign_id = validate_id("campaign_id", campaign_id)?;
        let engagement = services
            .store
            .get_campaign_metrics(&tenant_id, &campaign_id)
            .await?;
        let delivery = services
            .pinpoint
            .campaign_activity_metrics(&campaign_id)
            .await?;

        return Ok(json!({
            "tenant_id": tenant_id,
            "timestamp": timestamp,
            "engagement": engagement,
            "delivery": delivery,
        }));
    }

    let campaigns = services.pinpoint.list_campaigns(&tenant_id).await?;
    Ok(json!({
        "tenant_id": tenant_id,
        "timestamp": timestamp,
        "campaigns": campaigns.len(),
        "system_health": "healthy",
    }))
}

// --- POST /track --------------------------------------------------------

#[derive(Deserialize)]
struct TrackRequest {
    campaign_id: String,
    user_id: String,
    event_type: String,
    event_data: Option<Value>,
}

fn track_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("track")
        .and(warp::post())
        .and(authenticated(&services))
        .and(json_body::<TrackRequest>())
        .and(with_cloneable(services))
        .and_then(handle_track)
        .boxed()
}

#[tracing::instrument(name = "POST /track", skip_all)]
async fn handle_track(
    tenant_id: String,
    request: TrackRequest,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let campaign_id = validate_id("campaign_id", request.campaign_id)?;
        let user_id = validate_id("user_id", request.user_id)?;
        let event_type = validate_str("event_type", request.event_type, 1, 64)?;

        let event_id = services
            .store
            .track_campaign_event(
                &tenant_id,
                &campaign_id,
                &user_id,
                &event_type,
                &request.event_data.unwrap_or_else(|| json!({})),
            )
            .await?;

        Ok(json!({
            "message": "Event tracked",
            "event_id": event_id,
            "campaign_id": campaign_id,
            "event_type": event_type,
        }))
    }
    .await)
}

// --- GET /history/{user_id} ---------------------------------------------

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i32>,
}

fn history_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("history" / String)
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<LimitQuery>())
        .and(with_cloneable(services))
        .and_then(handle_history)
        .boxed()
}

#[tracing::instrument(name = "GET /history", skip_all)]
async fn handle_history(
    user_id: String,
    tenant_id: String,
    query: LimitQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let user_id = validate_id("user_id", user_id)?;
        let events = services
            .store
            .get_user_campaign_history(
                &tenant_id,
                &user_id,
                query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500),
            )
            .await?;

        Ok(json!({ "user_id": user_id, "tenant_id": tenant_id, "events": events }))
    }
    .await)
}

// --- /profiles ----------------------------------------------------------

fn put_profile_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("profiles" / String)
        .and(warp::put())
        .and(authenticated(&services))
        .and(json_body::<Value>())
        .and(with_cloneable(services))
        .and_then(handle_put_profile)
        .boxed()
}

#[tracing::instrument(name = "PUT /profiles", skip_all)]
async fn handle_put_profile(
    user_id: String,
    tenant_id: String,
    profile_data: Value,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let user_id = validate_id("user_id", user_id)?;
        if !profile_data.is_object() {
            client_bail!("The profile data must be a JSON object");
        }

        services
            .store
            .put_user_profile(&tenant_id, &user_id, &profile_data)
            .await?;

        Ok(json!({ "message": "Profile stored", "user_id": user_id }))
    }
    .await)
}

fn get_profile_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("profiles" / String)
        .and(warp::get())
        .and(authenticated(&services))
        .and(with_cloneable(services))
        .and_then(handle_get_profile)
        .boxed()
}

#[tracing::instrument(name = "GET /profiles/{user}", skip_all)]
async fn handle_get_profile(
    user_id: String,
    tenant_id: String,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let user_id = validate_id("user_id", user_id)?;
        services
            .store
            .get_user_profile(&tenant_id, &user_id)
            .await?
            .with_context(|| format!("No profile found for user '{}'", user_id))
            .mark_not_found()
    }
    .await)
}

fn merge_profile_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("profiles" / String)
        .and(warp::patch())
        .and(authenticated(&services))
        .and(json_body::<Value>())
        .and(with_cloneable(services))
        .and_then(handle_merge_profile)
        .boxed()
}

#[tracing::instrument(name = "PATCH /profiles", skip_all)]
async fn handle_merge_profile(
    user_id: String,
    tenant_id: String,
    updates: Value,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let user_id = validate_id("user_id", user_id)?;
        let Value::Object(updates) = updates else {
            client_bail!("The profile updates must be a JSON object");
        };
        if updates.is_empty() {
            client_bail!("At least one profile field is required");
        }

        services
            .store
            .merge_user_profile(&tenant_id, &user_id, &updates)
            .await?;

        Ok(json!({ "message": "Profile updated", "user_id": user_id, "fields": updates.len() }))
    }
    .await)
}

fn list_profiles_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("profiles")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<LimitQuery>())
        .and(with_cloneable(services))
        .and_then(handle_list_profiles)
        .boxed()
}

#[tracing::instrument(name = "GET /profiles", skip_all)]
async fn handle_list_profiles(
    tenant_id: String,
    query: LimitQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let profiles = services
            .store
            .list_user_profiles(
                &tenant_id,
                query.limit.unwrap_or(DEFAULT_PROFILE_LIMIT).clamp(1, 1000),
            )
            .await?;

        Ok(json!({ "tenant_id": tenant_id, "profiles": profiles }))
    }
    .await)
}

// --- /files -------------------------------------------------------------

#[derive(Deserialize)]
struct ListFilesQuery {
    prefix: Option<String>,
    max_keys: Option<i32>,
}

fn list_files_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("files")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<ListFilesQuery>())
        .and(with_cloneable(services))
        .and_then(handle_list_files)
        .boxed()
}

#[tracing::instrument(name = "GET /files", skip_all)]
async fn handle_list_files(
    tenant_id: String,
    query: ListFilesQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let files = services
            .s3
            .list(
                &tenant_id,
                query.prefix.as_deref().unwrap_or(""),
                query.max_keys.unwrap_or(1000).clamp(1, 1000),
            )
            .await?;

        Ok(json!({ "tenant_id": tenant_id, "files": files }))
    }
    .await)
}

#[derive(Deserialize)]
struct KeyQuery {
    key: String,
}

fn delete_file_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("files")
        .and(warp::delete())
        .and(authenticated(&services))
        .and(warp::query::<KeyQuery>())
        .and(with_cloneable(services))
        .and_then(handle_delete_file)
        .boxed()
}

#[tracing::instrument(name = "DELETE /files", skip_all)]
async fn handle_delete_file(
    tenant_id: String,
    query: KeyQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        services.s3.delete(&tenant_id, &query.key).await?;
        Ok(json!({ "message": "File deleted", "key": query.key }))
    }
    .await)
}

#[derive(Deserialize)]
struct PresignQuery {
    key: String,
    expires_in: Option<u64>,
}

fn presign_file_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("files" / "presign")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<PresignQuery>())
        .and(with_cloneable(services))
        .and_then(handle_presign_file)
        .boxed()
}

#[tracing::instrument(name = "GET /files/presign", skip_all)]
async fn handle_presign_file(
    tenant_id: String,
    query: PresignQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let expires_in = query
            .expires_in
            .unwrap_or(DEFAULT_PRESIGN_EXPIRY_SECS)
            .clamp(1, 7 * 24 * 3600);
        let url = services
            .s3
            .presigned_url(&tenant_id, &query.key, Duration::from_secs(expires_in))
            .await?;

        Ok(json!({ "key": query.key, "url": url, "expires_in": expires_in }))
    }
    .await)
}

fn file_metadata_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("files" / "metadata")
        .and(warp::get())
        .and(authenticated(&services))
        .and(warp::query::<KeyQuery>())
        .and(with_cloneable(services))
        .and_then(handle_file_metadata)
        .boxed()
}

#[tracing::instrument(name = "GET /files/metadata", skip_all)]
async fn handle_file_metadata(
    tenant_id: String,
    query: KeyQuery,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(services.s3.object_metadata(&tenant_id, &query.key).await)
}

// --- POST /events -------------------------------------------------------

#[derive(Deserialize)]
struct EventsRequest {
    tracking_id: String,
    session_id: String,
    user_id: String,
    events: Vec<TrackedEvent>,
}

fn events_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("events")
        .and(warp::post())
        .and(authenticated(&services))
        .and(json_body::<EventsRequest>())
        .and(with_cloneable(services))
        .and_then(handle_events)
        .boxed()
}

#[tracing::instrument(name = "POST /events", skip_all)]
async fn handle_events(
    _tenant_id: String,
    request: EventsRequest,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let user_id = validate_id("user_id", request.user_id)?;
        if request.events.is_empty() {
            client_bail!("At least one event is required");
        }

        let count = services
            .personalize
            .put_events(&request.tracking_id, &request.session_id, &user_id, request.events)
            .await?;

        Ok(json!({ "message": "Events sent", "user_id": user_id, "events_sent": count }))
    }
    .await)
}

// --- POST /notify -------------------------------------------------------

#[derive(Deserialize)]
struct NotifyRequest {
    user_id: String,
    channel: Option<String>,
}

fn notify_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("notify")
        .and(warp::post())
        .and(authenticated(&services))
        .and(json_body::<NotifyRequest>())
        .and(with_cloneable(services))
        .and_then(handle_notify)
        .boxed()
}

#[tracing::instrument(name = "POST /notify", skip_all)]
async fn handle_notify(
    tenant_id: String,
    request: NotifyRequest,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(perform_notify(tenant_id, request, services).await)
}

/// Sends the user's current recommendations over the chosen channel. Uses
/// the cache when warm, otherwise fetches from the campaign.
async fn perform_notify(
    tenant_id: String,
    request: NotifyRequest,
    services: Services,
) -> anyhow::Result<Value> {
    let channel: Channel = request.channel.as_deref().unwrap_or("email").parse()?;
    let user_id = validate_id("user_id", request.user_id)?;

    let recommendations = match services
        .store
        .get_cached_recommendations(&tenant_id, &user_id)
        .await?
    {
        Some(cached) => cached,
        None => {
            let campaign = services.personalize.get_campaign(&tenant_id).await?;
            services
                .personalize
                .get_recommendations(
                    &campaign.arn,
                    &user_id,
                    DEFAULT_RECOMMENDATION_LIMIT,
                    None,
                    None,
                )
                .await?
        }
    };

    if recommendations.is_empty() {
        client_bail!("No recommendations available for user '{}'", user_id);
    }

    let send = services
        .pinpoint
        .send_personalized_recommendations(&tenant_id, &user_id, &recommendations, channel)
        .await?;

    Ok(serde_json::to_value(send)?)
}

// --- POST /cleanup ------------------------------------------------------

fn cleanup_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("cleanup")
        .and(warp::post())
        .and(authenticated(&services))
        .and(with_cloneable(services))
        .and_then(handle_cleanup)
        .boxed()
}

#[tracing::instrument(name = "POST /cleanup", skip_all)]
async fn handle_cleanup(tenant_id: String, services: Services) -> Result<impl Reply, Rejection> {
    into_response(services.store.cleanup_expired_items(&tenant_id).await)
}

// --- POST /endpoints ----------------------------------------------------

#[derive(Deserialize)]
struct EndpointUpsertRequest {
    user_id: String,
    channel: String,
    address: String,
    user_attributes: Option<HashMap<String, Vec<String>>>,
}

fn endpoints_route(services: Services) -> BoxedFilter<(impl Reply,)> {
    warp::path!("endpoints")
        .and(warp::post())
        .and(authenticated(&services))
        .and(json_body::<EndpointUpsertRequest>())
        .and(with_cloneable(services))
        .and_then(handle_endpoints)
        .boxed()
}

#[tracing::instrument(name = "POST /endpoints", skip_all)]
async fn handle_endpoints(
    tenant_id: String,
    request: EndpointUpsertRequest,
    services: Services,
) -> Result<impl Reply, Rejection> {
    into_response(async {
        let channel: Channel = request.channel.parse()?;
        let user_id = validate_id("user_id", request.user_id)?;
        let address = validate_str("address", request.address, 1, 256)?;

        let endpoint = services
            .pinpoint
            .upsert_endpoint(&tenant_id, &user_id, channel, &address, request.user_attributes)
            .await?;

        Ok(serde_json::to_value(endpoint)?)
    }
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_route_replies_without_auth() {
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&health_route())
            .await;

        assert_eq!(response.status(), 200);

        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["services"]["personalize"], json!("configured"));
    }

    #[test]
    fn only_csv_uploads_pass_validation() {
        assert!(validate_csv_filename("interactions.csv").is_ok());
        assert!(validate_csv_filename("interactions.parquet").is_err());
        assert!(validate_csv_filename("csv").is_err());
    }

    #[test]
    fn default_dataset_location_points_at_the_tenant_interactions() {
        assert_eq!(
            default_dataset_location("saffron-data", "t1"),
            "s3://saffron-data/t1/datasets/interactions/interactions.csv"
        );
    }
}
