//! Reads a guild's roles and channels and turns them into specs.

use crate::error::CloneError;
use crate::http::{Body, Route};
use crate::model::{CategorySpec, ChannelSpec, RoleSpec};
use crate::rest::Rest;
use crate::sink::Logger;
use crate::types::{Channel, ChannelType, Role};

/// Everything the creator needs from the source guild.
#[derive(Debug, Clone, Default)]
pub struct SourceEntities {
    /// Highest position first.
    pub roles: Vec<RoleSpec>,
    pub categories: Vec<CategorySpec>,
    pub text_channels: Vec<ChannelSpec>,
    pub voice_channels: Vec<ChannelSpec>,
}

impl SourceEntities {
    pub fn total_channels(&self) -> usize {
        self.categories.len() + self.text_channels.len() + self.voice_channels.len()
    }
}

/// `GET /guilds/{id}/roles`. `None` when the call failed (already counted and
/// logged).
pub async fn list_roles(rest: &Rest, guild_id: &str) -> Result<Option<Vec<Role>>, CloneError> {
    rest.call_json(
        &format!("fetching roles of guild {}", guild_id),
        &Route::get_roles(guild_id),
        &Body::Empty,
    )
    .await
}

/// `GET /guilds/{id}/channels`. `None` when the call failed.
pub async fn list_channels(
    rest: &Rest,
    guild_id: &str,
) -> Result<Option<Vec<Channel>>, CloneError> {
    rest.call_json(
        &format!("fetching channels of guild {}", guild_id),
        &Route::get_channels(guild_id),
        &Body::Empty,
    )
    .await
}

/// Drop the everyone role and order the rest highest first.
pub fn role_specs(guild_id: &str, roles: &[Role]) -> Vec<RoleSpec> {
    let mut specs: Vec<RoleSpec> = roles
        .iter()
        .filter(|r| !r.is_everyone(guild_id))
        .map(RoleSpec::from)
        .collect();
    // Each created role lands just above everyone, so creating the highest
    // first rebuilds the original order.
    specs.sort_by(|a, b| b.position.cmp(&a.position));
    specs
}

/// Split channels into categories, text and voice, in fetch order.
pub fn partition_channels(
    channels: &[Channel],
    log: &Logger,
) -> (Vec<CategorySpec>, Vec<ChannelSpec>, Vec<ChannelSpec>) {
    let mut categories = Vec::new();
    let mut text = Vec::new();
    let mut voice = Vec::new();

    for channel in channels {
        match channel.channel_type() {
            Some(ChannelType::GuildCategory) => categories.push(CategorySpec::from(channel)),
            Some(ChannelType::GuildText | ChannelType::GuildAnnouncement) => {
                text.push(ChannelSpec::text(channel))
            }
            Some(ChannelType::GuildVoice) => voice.push(ChannelSpec::voice(channel)),
            _ => log.info(format!(
                "Skipping channel {} (unsupported type {})",
                channel.display_name(),
                channel.kind
            )),
        }
    }

    (categories, text, voice)
}

/// Fetch and partition the source guild. Fails only when neither list could
/// be read, or on a fatal error.
pub async fn fetch_source(rest: &Rest, guild_id: &str) -> Result<SourceEntities, CloneError> {
    let roles = list_roles(rest, guild_id).await?;
    let channels = list_channels(rest, guild_id).await?;

    if roles.is_none() && channels.is_none() {
        return Err(CloneError::SourceUnavailable(guild_id.to_string()));
    }

    let mut entities = SourceEntities::default();
    if let Some(roles) = roles {
        entities.roles = role_specs(guild_id, &roles);
    }
    if let Some(channels) = channels {
        let (categories, text, voice) = partition_channels(&channels, rest.log());
        entities.categories = categories;
        entities.text_channels = text;
        entities.voice_channels = voice;
    }

    tracing::debug!(
        guild_id,
        roles = entities.roles.len(),
        categories = entities.categories.len(),
        text = entities.text_channels.len(),
        voice = entities.voice_channels.len(),
        "fetched source guild"
    );
    Ok(entities)
}
