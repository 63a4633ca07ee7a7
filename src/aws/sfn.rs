//! Step Functions adapter for the training workflow.

use crate::config::Settings;
use crate::tools::ids;
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_sfn::Client;
use aws_sdk_sfn::primitives::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

const EXECUTION_ID_LENGTH: usize = 10;

#[derive(Clone, Debug)]
pub struct WorkflowClient {
    pub client: Client,
    state_machine_arn: String,
}

#[derive(Debug, Serialize)]
pub struct ExecutionInfo {
    pub execution_arn: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ExecutionStatus {
    pub execution_arn: String,
    pub status: String,
    pub started_at: String,
    pub stopped_at: Option<String>,
    pub output: Option<String>,
}

impl WorkflowClient {
    pub fn new(sdk_config: &SdkConfig, settings: &Settings) -> WorkflowClient {
        tracing::info!("Setting up Step Functions....");
        WorkflowClient {
            client: Client::new(sdk_config),
            state_machine_arn: settings.training_state_machine_arn.clone(),
        }
    }

    /// Starts a training run for the tenant. Execution names must be unique
    /// per state machine, hence the random suffix.
    #[tracing::instrument(skip(self), err(Display))]
    pub async fn start_training_workflow(
        &self,
        tenant_id: &str,
        dataset_location: &str,
    ) -> anyhow::Result<ExecutionInfo> {
        let name = format!("training-{}-{}", tenant_id, ids::generate_id(EXECUTION_ID_LENGTH));
        let input = json!({
            "tenant_id": tenant_id,
            "dataset_location": dataset_location,
            "requested_at": Utc::now().to_rfc3339(),
        });

        let output = self
            .client
            .start_execution()
            .state_machine_arn(&self.state_machine_arn)
            .name(&name)
            .input(input.to_string())
            .send()
            .await
            .with_context(|| format!("Failed to start training workflow for tenant '{}'", tenant_id))?;

        tracing::info!("Training workflow started: {}", output.execution_arn());

        Ok(ExecutionInfo {
            execution_arn: output.execution_arn().to_string(),
            name,
            status: "RUNNING".to_string(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_execution_status(
        &self,
        execution_arn: &str,
    ) -> anyhow::Result<ExecutionStatus> {
        let output = self
            .client
            .describe_execution()
            .execution_arn(execution_arn)
            .send()
            .await
            .with_context(|| format!("Failed to describe execution '{}'", execution_arn))?;

        Ok(ExecutionStatus {
            execution_arn: output.execution_arn().to_string(),
            status: output.status().as_str().to_string(),
            started_at: to_rfc3339(output.start_date()),
            stopped_at: output.stop_date().map(to_rfc3339),
            output: output.output().map(str::to_string),
        })
    }
}

fn to_rfc3339(timestamp: &DateTime) -> String {
    chrono::DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
        .map(|parsed| parsed.to_rfc3339())
        .unwrap_or_else(|| timestamp.secs().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_as_rfc3339() {
        let rendered = to_rfc3339(&DateTime::from_secs(1_700_000_000));
        assert!(rendered.starts_with("2023-11-14T"));
    }

    #[test]
    fn execution_names_are_unique_per_start() {
        let first = format!("training-t1-{}", ids::generate_id(EXECUTION_ID_LENGTH));
        let second = format!("training-t1-{}", ids::generate_id(EXECUTION_ID_LENGTH));
        assert_ne!(first, second);
    }
}
