use saffron::aws::dynamodb::{DynamoClient, PersonalizationStore};
use saffron::aws::personalize::PersonalizeClient;
use saffron::aws::pinpoint::PinpointClient;
use saffron::aws::s3::S3Client;
use saffron::aws::sfn::WorkflowClient;
use saffron::config::Settings;
use saffron::web::api::{Services, api_routes};
use saffron::web::warp::run_webserver;
use saffron::{await_termination, aws, logging};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::setup_tracing();
    tracing::info!("Starting {} {}...", *saffron::APP_NAME, *saffron::APP_VERSION);

    let settings = Arc::new(Settings::from_env()?);
    let sdk_config = aws::load_sdk_config(&settings).await;

    let dynamo = DynamoClient::new(&sdk_config);
    let services = Services {
        s3: S3Client::new(&sdk_config, &settings),
        store: PersonalizationStore::new(dynamo, &settings),
        personalize: PersonalizeClient::new(&sdk_config, &settings),
        pinpoint: PinpointClient::new(&sdk_config, &settings),
        workflows: WorkflowClient::new(&sdk_config, &settings),
        settings,
    };

    let routes = api_routes(services);

    tokio::select! {
        result = run_webserver(routes) => result,
        _ = await_termination("saffron api") => Ok(()),
    }
}
