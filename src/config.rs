//! Typed application settings parsed from the environment.
//!
//! Every adapter receives a reference to [`Settings`] at construction time;
//! nothing reads service configuration from the environment after startup.

use anyhow::{Context, bail};
use std::env;

/// Regions this deployment is allowed to run against.
pub const VALID_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-west-2",
    "eu-central-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
];

#[derive(Clone, Debug)]
pub struct Settings {
    pub aws_region: String,

    pub s3_bucket_name: String,
    pub s3_data_prefix: String,

    pub recommendations_table: String,
    pub user_profiles_table: String,
    pub campaign_tracking_table: String,

    pub dataset_group_prefix: String,
    pub solution_prefix: String,
    pub campaign_prefix: String,
    pub event_tracker_prefix: String,
    pub personalize_role_arn: String,

    pub pinpoint_application_id: String,
    pub pinpoint_from_address: String,

    pub training_state_machine_arn: String,

    pub api_key: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Settings> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable source. This is the
    /// actual implementation behind [`Settings::from_env`] and lets tests
    /// supply variables without touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Settings> {
        let settings = Settings {
            aws_region: optional(&lookup, "AWS_REGION", "us-east-1"),
            s3_bucket_name: required(&lookup, "S3_BUCKET_NAME")?,
            s3_data_prefix: optional(&lookup, "S3_DATA_PREFIX", "data"),
            recommendations_table: required(&lookup, "DYNAMO_RECOMMENDATIONS_TABLE")?,
            user_profiles_table: required(&lookup, "DYNAMO_USER_PROFILES_TABLE")?,
            campaign_tracking_table: required(&lookup, "DYNAMO_CAMPAIGN_TRACKING_TABLE")?,
            dataset_group_prefix: required(&lookup, "PERSONALIZE_DATASET_GROUP")?,
            solution_prefix: optional(&lookup, "PERSONALIZE_SOLUTION", "retail-recommendations"),
            campaign_prefix: optional(&lookup, "PERSONALIZE_CAMPAIGN", "retail-campaign"),
            event_tracker_prefix: optional(&lookup, "PERSONALIZE_EVENT_TRACKER", "retail-events"),
            personalize_role_arn: required(&lookup, "PERSONALIZE_ROLE_ARN")?,
            pinpoint_application_id: required(&lookup, "PINPOINT_APPLICATION_ID")?,
            pinpoint_from_address: required(&lookup, "PINPOINT_FROM_ADDRESS")?,
            training_state_machine_arn: required(&lookup, "TRAINING_STATE_MACHINE_ARN")?,
            api_key: required(&lookup, "API_KEY")?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.s3_bucket_name.trim().is_empty() {
            bail!("S3_BUCKET_NAME must not be empty");
        }

        if !VALID_REGIONS.contains(&self.aws_region.as_str()) {
            bail!(
                "Invalid AWS region '{}'. Must be one of: {}",
                self.aws_region,
                VALID_REGIONS.join(", ")
            );
        }

        Ok(())
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<String> {
    lookup(name).with_context(|| format!("No {} provided in environment", name))
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("S3_BUCKET_NAME", "saffron-data"),
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
        ])
    }

    fn from_vars(vars: HashMap<&'static str, &'static str>) -> anyhow::Result<Settings> {
        Settings::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn loads_with_defaults() {
        let settings = from_vars(base_vars()).unwrap();

        assert_eq!(settings.aws_region, "us-east-1");
        assert_eq!(settings.s3_data_prefix, "data");
        assert_eq!(settings.solution_prefix, "retail-recommendations");
        assert_eq!(settings.campaign_prefix, "retail-campaign");
        assert_eq!(settings.event_tracker_prefix, "retail-events");
    }

    #[test]
    fn rejects_missing_bucket() {
        let mut vars = base_vars();
        vars.remove("S3_BUCKET_NAME");

        assert!(from_vars(vars).is_err());
    }

    #[test]
    fn rejects_blank_bucket() {
        let mut vars = base_vars();
        vars.insert("S3_BUCKET_NAME", "  ");

        assert!(from_vars(vars).is_err());
    }

    #[test]
    fn rejects_unknown_region() {
        let mut vars = base_vars();
        vars.insert("AWS_REGION", "mars-north-1");

        let err = from_vars(vars).unwrap_err();
        assert!(err.to_string().contains("mars-north-1"));
    }

    #[test]
    fn accepts_allow_listed_region() {
        let mut vars = base_vars();
        vars.insert("AWS_REGION", "eu-central-1");

        assert_eq!(from_vars(vars).unwrap().aws_region, "eu-central-1");
    }
}
