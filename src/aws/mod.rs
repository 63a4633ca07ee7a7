use crate::config::Settings;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};

pub mod dynamodb;
pub mod personalize;
pub mod pinpoint;
pub mod s3;
pub mod sfn;

/// Builds the shared SDK configuration used by all service clients:
/// the configured region plus an adaptive retry policy capped at three
/// attempts. Adapters never retry on their own.
pub async fn load_sdk_config(settings: &Settings) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.aws_region.clone()))
        .retry_config(RetryConfig::adaptive().with_max_attempts(3))
        .load()
        .await
}

#[cfg(test)]
pub mod test {
    use rand::random;

    pub fn test_run_id() -> String {
        let unique_id = random::<u32>();
        if let Ok(run) = std::env::var("TEST_RUN_ID") {
            format!("{}-{}", run, unique_id)
        } else {
            format!("{}", unique_id)
        }
    }
}
