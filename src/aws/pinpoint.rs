//! Amazon Pinpoint adapter: segments, campaigns and direct personalized
//! sends. Channel-specific content is rendered locally; anything invalid
//! (unknown channel, empty recipient list) is rejected before a request
//! goes out.

use crate::aws::dynamodb::store::RecommendedItem;
use crate::client_bail;
use crate::config::Settings;
use anyhow::Context;
use aws_config::SdkConfig;
use aws_sdk_pinpoint::Client;
use aws_sdk_pinpoint::types::{
    AttributeDimension, AttributeType, CampaignEmailMessage, CampaignSmsMessage, ChannelType,
    DirectMessageConfiguration, EmailMessage, EndpointRequest, EndpointSendConfiguration,
    EndpointUser, Frequency, MessageConfiguration, MessageType, Schedule, SegmentDimensions,
    SendUsersMessageRequest, SimpleEmail, SimpleEmailPart, SmsMessage, WriteCampaignRequest,
    WriteSegmentRequest,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const MAX_EMAIL_RECOMMENDATIONS: usize = 5;
const MAX_SMS_LENGTH: usize = 160;

#[derive(Clone, Debug)]
pub struct PinpointClient {
    pub client: Client,
    application_id: String,
    from_address: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Channel> {
        match value {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => client_bail!("Unsupported channel '{}'. Use one of: email, sms", other),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    pub segment_id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CampaignInfo {
    pub campaign_id: String,
    pub name: String,
    pub segment_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CampaignSummary {
    pub campaign_id: String,
    pub name: String,
    pub state: Option<String>,
    pub segment_id: String,
    pub creation_date: String,
    pub last_modified_date: String,
}

#[derive(Debug, Serialize)]
pub struct ActivityMetrics {
    pub activity_id: String,
    pub state: Option<String>,
    pub result: Option<String>,
    pub total_endpoints: i32,
    pub successful_endpoints: i32,
}

#[derive(Debug, Serialize)]
pub struct SendInfo {
    pub message_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub recommendations_count: usize,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointInfo {
    pub endpoint_id: String,
    pub channel_type: String,
    pub address: String,
    pub user_id: Option<String>,
    pub endpoint_status: Option<String>,
}

impl PinpointClient {
    pub fn new(sdk_config: &SdkConfig, settings: &Settings) -> PinpointClient {
        tracing::info!("Setting up Pinpoint....");
        PinpointClient {
            client: Client::new(sdk_config),
            application_id: settings.pinpoint_application_id.clone(),
            from_address: settings.pinpoint_from_address.clone(),
        }
    }

    pub fn endpoint_id(tenant_id: &str, user_id: &str, channel: Channel) -> String {
        format!("{}-{}-{}", tenant_id, user_id, channel)
    }

    /// Creates a segment matching the tenant and, when given, a set of
    /// user ids.
    #[tracing::instrument(skip(self, user_ids), err(Display))]
    pub async fn create_segment(
        &self,
        tenant_id: &str,
        segment_name: &str,
        user_ids: &[String],
    ) -> anyhow::Result<SegmentInfo> {
        let mut dimensions = SegmentDimensions::builder().user_attributes(
            "tenant_id",
            AttributeDimension::builder()
                .attribute_type(AttributeType::Inclusive)
                .values(tenant_id)
                .build(),
        );

        if !user_ids.is_empty() {
            dimensions = dimensions.user_attributes(
                "user_id",
                AttributeDimension::builder()
                    .attribute_type(AttributeType::Inclusive)
                    .set_values(Some(user_ids.to_vec()))
                    .build(),
            );
        }

        let name = format!("{}-{}", segment_name, tenant_id);
        let result = self
            .client
            .create_segment()
            .application_id(&self.application_id)
            .write_segment_request(
                WriteSegmentRequest::builder()
                    .name(&name)
                    .dimensions(dimensions.build())
                    .tags("TenantId", tenant_id)
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to create segment for tenant '{}'", tenant_id))?;

        let segment = result.segment_response();
        tracing::info!("Created segment '{}' for tenant '{}'", segment.id(), tenant_id);

        Ok(SegmentInfo {
            segment_id: segment.id().to_string(),
            name,
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_segment(&self, segment_id: &str) -> anyhow::Result<SegmentInfo> {
        let result = self
            .client
            .get_segment()
            .application_id(&self.application_id)
            .segment_id(segment_id)
            .send()
            .await
            .with_context(|| format!("Failed to get segment '{}'", segment_id))?;

        let segment = result.segment_response();

        Ok(SegmentInfo {
            segment_id: segment.id().to_string(),
            name: segment.name().unwrap_or_default().to_string(),
        })
    }

    /// Creates an email campaign for the segment and launches it
    /// immediately.
    #[tracing::instrument(skip(self, html_content, text_content), err(Display))]
    pub async fn send_email_campaign(
        &self,
        tenant_id: &str,
        campaign_name: &str,
        segment_id: &str,
        subject: &str,
        html_content: &str,
        text_content: Option<&str>,
    ) -> anyhow::Result<CampaignInfo> {
        let mut email = CampaignEmailMessage::builder()
            .from_address(&self.from_address)
            .html_body(html_content)
            .title(subject);
        if let Some(text) = text_content {
            email = email.body(text);
        }

        let message_configuration = MessageConfiguration::builder()
            .email_message(email.build())
            .build();

        self.launch_campaign(tenant_id, campaign_name, segment_id, message_configuration, "email")
            .await
    }

    /// Creates an SMS campaign for the segment and launches it immediately.
    #[tracing::instrument(skip(self, message), err(Display))]
    pub async fn send_sms_campaign(
        &self,
        tenant_id: &str,
        campaign_name: &str,
        segment_id: &str,
        message: &str,
    ) -> anyhow::Result<CampaignInfo> {
        let message_configuration = MessageConfiguration::builder()
            .sms_message(
                CampaignSmsMessage::builder()
                    .body(message)
                    .message_type(MessageType::Promotional)
                    .build(),
            )
            .build();

        self.launch_campaign(tenant_id, campaign_name, segment_id, message_configuration, "sms")
            .await
    }

    async fn launch_campaign(
        &self,
        tenant_id: &str,
        campaign_name: &str,
        segment_id: &str,
        message_configuration: MessageConfiguration,
        campaign_type: &str,
    ) -> anyhow::Result<CampaignInfo> {
        let name = format!("{}-{}", campaign_name, tenant_id);

        let schedule = Schedule::builder()
            .start_time("IMMEDIATE")
            .frequency(Frequency::Once)
            .build();

        let result = self
            .client
            .create_campaign()
            .application_id(&self.application_id)
            .write_campaign_request(
                WriteCampaignRequest::builder()
                    .name(&name)
                    .segment_id(segment_id)
                    .message_configuration(message_configuration)
                    .schedule(schedule)
                    .tags("TenantId", tenant_id)
                    .tags("CampaignType", campaign_type)
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to create {} campaign '{}'", campaign_type, name))?;

        let campaign = result.campaign_response();

        tracing::info!("Launched {} campaign '{}' for tenant '{}'", campaign_type, campaign.id(), tenant_id);

        Ok(CampaignInfo {
            campaign_id: campaign.id().to_string(),
            name,
            segment_id: segment_id.to_string(),
            status: "SENT".to_string(),
        })
    }

    /// Sends the recommendation list straight to one user over the chosen
    /// channel.
    #[tracing::instrument(skip(self, recommendations), err(Display))]
    pub async fn send_personalized_recommendations(
        &self,
        tenant_id: &str,
        user_id: &str,
        recommendations: &[RecommendedItem],
        channel: Channel,
    ) -> anyhow::Result<SendInfo> {
        let message_configuration = match channel {
            Channel::Email => {
                let (subject, html) = render_recommendations_email(recommendations);
                DirectMessageConfiguration::builder()
                    .email_message(
                        EmailMessage::builder()
                            .from_address(&self.from_address)
                            .simple_email(
                                SimpleEmail::builder()
                                    .subject(email_part(&subject))
                                    .html_part(email_part(&html))
                                    .build(),
                            )
                            .build(),
                    )
                    .build()
            }
            Channel::Sms => DirectMessageConfiguration::builder()
                .sms_message(
                    SmsMessage::builder()
                        .body(render_recommendations_sms(recommendations))
                        .message_type(MessageType::Promotional)
                        .build(),
                )
                .build(),
        };

        let result = self
            .client
            .send_users_messages()
            .application_id(&self.application_id)
            .send_users_message_request(
                SendUsersMessageRequest::builder()
                    .message_configuration(message_configuration)
                    .users(user_id, EndpointSendConfiguration::builder().build())
                    .build(),
            )
            .send()
            .await
            .with_context(|| {
                format!("Failed to send personalized message to user '{}'", user_id)
            })?;

        let message_id = result
            .send_users_message_response()
            .request_id()
            .unwrap_or_default()
            .to_string();

        tracing::info!(
            "Sent personalized recommendations via {} to user '{}'",
            channel,
            user_id
        );

        Ok(SendInfo {
            message_id,
            user_id: user_id.to_string(),
            channel,
            recommendations_count: recommendations.len(),
            status: "SENT".to_string(),
        })
    }

    /// Creates or updates the user's endpoint for a channel.
    #[tracing::instrument(skip(self, user_attributes), err(Display))]
    pub async fn upsert_endpoint(
        &self,
        tenant_id: &str,
        user_id: &str,
        channel: Channel,
        address: &str,
        user_attributes: Option<HashMap<String, Vec<String>>>,
    ) -> anyhow::Result<EndpointInfo> {
        let endpoint_id = Self::endpoint_id(tenant_id, user_id, channel);

        let mut attributes = user_attributes.unwrap_or_default();
        attributes
            .entry("tenant_id".to_string())
            .or_insert_with(|| vec![tenant_id.to_string()]);

        let channel_type = match channel {
            Channel::Email => ChannelType::Email,
            Channel::Sms => ChannelType::Sms,
        };

        self.client
            .update_endpoint()
            .application_id(&self.application_id)
            .endpoint_id(&endpoint_id)
            .endpoint_request(
                EndpointRequest::builder()
                    .channel_type(channel_type)
                    .address(address)
                    .user(
                        EndpointUser::builder()
                            .user_id(user_id)
                            .set_user_attributes(Some(attributes))
                            .build(),
                    )
                    .attributes("tenant_id", vec![tenant_id.to_string()])
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to update endpoint for user '{}'", user_id))?;

        tracing::info!("Updated {} endpoint for user '{}'", channel, user_id);

        Ok(EndpointInfo {
            endpoint_id,
            channel_type: channel.to_string(),
            address: address.to_string(),
            user_id: Some(user_id.to_string()),
            endpoint_status: Some("ACTIVE".to_string()),
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn get_endpoint(&self, endpoint_id: &str) -> anyhow::Result<EndpointInfo> {
        let result = self
            .client
            .get_endpoint()
            .application_id(&self.application_id)
            .endpoint_id(endpoint_id)
            .send()
            .await
            .with_context(|| format!("Failed to get endpoint '{}'", endpoint_id))?;

        let endpoint = result.endpoint_response();

        Ok(EndpointInfo {
            endpoint_id: endpoint.id().unwrap_or(endpoint_id).to_string(),
            channel_type: endpoint
                .channel_type()
                .map(|channel| channel.as_str().to_string())
                .unwrap_or_default(),
            address: endpoint.address().unwrap_or_default().to_string(),
            user_id: endpoint
                .user()
                .and_then(|user| user.user_id())
                .map(str::to_string),
            endpoint_status: endpoint.endpoint_status().map(str::to_string),
        })
    }

    /// Delivery state per campaign activity.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn campaign_activity_metrics(
        &self,
        campaign_id: &str,
    ) -> anyhow::Result<Vec<ActivityMetrics>> {
        let result = self
            .client
            .get_campaign_activities()
            .application_id(&self.application_id)
            .campaign_id(campaign_id)
            .send()
            .await
            .with_context(|| format!("Failed to read activities of campaign '{}'", campaign_id))?;

        let metrics = result
            .activities_response()
            .item()
            .iter()
            .map(|activity| ActivityMetrics {
                activity_id: activity.id().to_string(),
                state: activity.state().map(str::to_string),
                result: activity.result().map(str::to_string),
                total_endpoints: activity.total_endpoint_count().unwrap_or(0),
                successful_endpoints: activity.successful_endpoint_count().unwrap_or(0),
            })
            .collect();

        Ok(metrics)
    }

    /// Lists the campaigns carrying this tenant's tag.
    #[tracing::instrument(level = "debug", skip(self), err(Display))]
    pub async fn list_campaigns(&self, tenant_id: &str) -> anyhow::Result<Vec<CampaignSummary>> {
        let result = self
            .client
            .get_campaigns()
            .application_id(&self.application_id)
            .send()
            .await
            .with_context(|| format!("Failed to list campaigns for tenant '{}'", tenant_id))?;

        let campaigns = result
            .campaigns_response()
            .item()
            .iter()
            .filter(|campaign| {
                campaign
                    .tags()
                    .and_then(|tags| tags.get("TenantId"))
                    .map(|tag| tag == tenant_id)
                    .unwrap_or(false)
            })
            .map(|campaign| CampaignSummary {
                campaign_id: campaign.id().to_string(),
                name: campaign.name().unwrap_or_default().to_string(),
                state: campaign
                    .state()
                    .and_then(|state| state.campaign_status())
                    .map(|status| status.as_str().to_string()),
                segment_id: campaign.segment_id().to_string(),
                creation_date: campaign.creation_date().to_string(),
                last_modified_date: campaign.last_modified_date().to_string(),
            })
            .collect::<Vec<_>>();

        tracing::debug!("Listed {} campaigns for tenant '{}'", campaigns.len(), tenant_id);
        Ok(campaigns)
    }

    #[tracing::instrument(skip(self), err(Display))]
    pub async fn delete_campaign(&self, campaign_id: &str) -> anyhow::Result<()> {
        self.client
            .delete_campaign()
            .application_id(&self.application_id)
            .campaign_id(campaign_id)
            .send()
            .await
            .with_context(|| format!("Failed to delete campaign '{}'", campaign_id))?;

        Ok(())
    }
}

fn email_part(data: &str) -> SimpleEmailPart {
    SimpleEmailPart::builder().charset("UTF-8").data(data).build()
}

/// Renders the recommendation email: subject plus an HTML body listing at
/// most five items.
pub fn render_recommendations_email(items: &[RecommendedItem]) -> (String, String) {
    let subject = "Personalized Recommendations Just for You!".to_string();

    let mut html = String::from(
        "<html><body><h2>Hi there!</h2>\
         <p>We've found some great products you might like:</p><ul>",
    );
    for item in items.iter().take(MAX_EMAIL_RECOMMENDATIONS) {
        html.push_str(&format!(
            "<li><strong>{}</strong> (score {:.2})</li>",
            item.item_id, item.score
        ));
    }
    html.push_str("</ul><p>Happy shopping!</p></body></html>");

    (subject, html)
}

/// Renders the SMS variant, truncated to a single message.
pub fn render_recommendations_sms(items: &[RecommendedItem]) -> String {
    let mut message = format!("Hi! We found {} great products for you.", items.len());
    if let Some(first) = items.first() {
        message.push_str(&format!(" Check out: {}!", first.item_id));
    }

    truncate_message(&message, MAX_SMS_LENGTH)
}

fn truncate_message(message: &str, max_length: usize) -> String {
    if message.len() <= max_length {
        message.to_string()
    } else {
        let mut cut = max_length;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message[..cut].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(count: usize) -> Vec<RecommendedItem> {
        (0..count)
            .map(|index| RecommendedItem {
                item_id: format!("sku-{}", index),
                score: 0.9 - index as f64 * 0.1,
            })
            .collect()
    }

    #[test]
    fn channel_parses_known_values_only() {
        assert_eq!("email".parse::<Channel>().unwrap(), Channel::Email);
        assert_eq!("sms".parse::<Channel>().unwrap(), Channel::Sms);

        let err = "push".parse::<Channel>().unwrap_err();
        assert!(err.to_string().contains("push"));
    }

    #[test]
    fn email_lists_at_most_five_recommendations() {
        let (_, html) = render_recommendations_email(&items(8));
        assert_eq!(html.matches("<li>").count(), 5);
        assert!(html.contains("sku-0"));
        assert!(html.contains("sku-4"));
        assert!(!html.contains("sku-5"));
    }

    #[test]
    fn email_formats_scores_with_two_decimals() {
        let (subject, html) = render_recommendations_email(&items(1));
        assert_eq!(subject, "Personalized Recommendations Just for You!");
        assert!(html.contains("score 0.90"));
    }

    #[test]
    fn sms_names_the_top_recommendation() {
        let text = render_recommendations_sms(&items(3));
        assert_eq!(text, "Hi! We found 3 great products for you. Check out: sku-0!");
    }

    #[test]
    fn sms_with_no_recommendations_omits_the_teaser() {
        let text = render_recommendations_sms(&[]);
        assert_eq!(text, "Hi! We found 0 great products for you.");
    }

    #[test]
    fn sms_is_truncated_to_a_single_message() {
        let long = vec![RecommendedItem {
            item_id: "x".repeat(300),
            score: 1.0,
        }];
        let text = render_recommendations_sms(&long);
        assert_eq!(text.len(), MAX_SMS_LENGTH);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = truncate_message(&"ä".repeat(100), 9);
        assert!(text.len() <= 9);
        assert!(text.chars().all(|c| c == 'ä'));
    }

    #[test]
    fn endpoint_ids_combine_tenant_user_and_channel() {
        assert_eq!(
            PinpointClient::endpoint_id("t1", "u1", Channel::Email),
            "t1-u1-email"
        );
    }
}
