//! Header-based request authentication.
//!
//! Every non-health route requires two headers: `x-api-key`, checked
//! against the configured key, and `x-tenant-id`, which scopes all adapter
//! calls. A missing or wrong key yields 401, a missing or malformed tenant
//! id yields 400.

use crate::config::Settings;
use crate::status_bail;
use crate::web::validation::validate_id;
use crate::web::warp::{into_rejection, with_cloneable};
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Requires a valid API key and a well-formed tenant id, extracting the
/// tenant id for the route handler.
pub fn with_tenant(
    settings: Arc<Settings>,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::any()
        .and(warp::header::optional::<String>(API_KEY_HEADER))
        .and(warp::header::optional::<String>(TENANT_HEADER))
        .and(with_cloneable(settings))
        .and_then(|api_key, tenant_id, settings| async {
            check_headers(api_key, tenant_id, settings).map_err(into_rejection)
        })
}

fn check_headers(
    api_key: Option<String>,
    tenant_id: Option<String>,
    settings: Arc<Settings>,
) -> anyhow::Result<String> {
    match api_key {
        Some(key) if key == settings.api_key => {}
        _ => status_bail!(StatusCode::UNAUTHORIZED, "Invalid API key"),
    }

    let Some(tenant_id) = tenant_id else {
        status_bail!(StatusCode::BAD_REQUEST, "Tenant ID is required");
    };

    validate_id("tenant_id", tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::error::ApiError;
    use std::collections::HashMap;

    fn test_settings() -> Arc<Settings> {
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
            ("API_KEY", "valid-key"),
        ]);

        Arc::new(
            Settings::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap(),
        )
    }

    #[tokio::test]
    async fn accepts_valid_key_and_tenant() {
        let filter = with_tenant(test_settings());

        let tenant = warp::test::request()
            .header(API_KEY_HEADER, "valid-key")
            .header(TENANT_HEADER, "demo-tenant")
            .filter(&filter)
            .await
            .unwrap();

        assert_eq!(tenant, "demo-tenant");
    }

    #[tokio::test]
    async fn rejects_missing_api_key() {
        let filter = with_tenant(test_settings());

        let res = warp::test::request()
            .header(TENANT_HEADER, "demo-tenant")
            .filter(&filter)
            .await;

        let rejection = res.unwrap_err();
        let api_error = rejection.find::<ApiError>().unwrap();
        assert_eq!(api_error.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_wrong_api_key() {
        let filter = with_tenant(test_settings());

        let res = warp::test::request()
            .header(API_KEY_HEADER, "wrong-key")
            .header(TENANT_HEADER, "demo-tenant")
            .filter(&filter)
            .await;

        let rejection = res.unwrap_err();
        let api_error = rejection.find::<ApiError>().unwrap();
        assert_eq!(api_error.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_missing_tenant_with_bad_request() {
        let filter = with_tenant(test_settings());

        let res = warp::test::request()
            .header(API_KEY_HEADER, "valid-key")
            .filter(&filter)
            .await;

        let rejection = res.unwrap_err();
        let api_error = rejection.find::<ApiError>().unwrap();
        assert_eq!(api_error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_malformed_tenant_id() {
        let filter = with_tenant(test_settings());

        let res = warp::test::request()
            .header(API_KEY_HEADER, "valid-key")
            .header(TENANT_HEADER, "bad tenant!")
            .filter(&filter)
            .await;

        let rejection = res.unwrap_err();
        let api_error = rejection.find::<ApiError>().unwrap();
        assert_eq!(api_error.status, StatusCode::BAD_REQUEST);
    }
}
