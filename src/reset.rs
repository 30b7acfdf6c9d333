//! Clears the destination guild before creation.
//!
//! Every deletion is its own REST call; a rejected deletion is counted and the
//! loop moves on.

use crate::error::CloneError;
use crate::fetch::{list_channels, list_roles};
use crate::http::{Body, Route};
use crate::rest::Rest;
use crate::stats::Counter;
use crate::types::{Channel, ChannelType};

/// Delete every role except everyone and managed roles.
pub async fn reset_roles(rest: &Rest, guild_id: &str) -> Result<(), CloneError> {
    let Some(roles) = list_roles(rest, guild_id).await? else {
        return Ok(());
    };

    for role in roles {
        if role.is_everyone(guild_id) {
            continue;
        }
        if role.managed {
            rest.log()
                .info(format!("Skipping managed role {}", role.name));
            continue;
        }

        let what = format!("deleting role {}", role.name);
        let deleted = rest
            .call(&what, &Route::delete_role(guild_id, &role.id), &Body::Empty)
            .await?;
        if deleted.is_some() {
            rest.stats().bump(Counter::RolesDeleted);
            rest.log().info(format!("Role deleted: {}", role.name));
        }
        rest.pace().await?;
    }
    Ok(())
}

/// Children first: every non-category channel, then the categories. Order is
/// otherwise preserved.
pub fn deletion_order(channels: Vec<Channel>) -> Vec<Channel> {
    let (categories, mut rest): (Vec<_>, Vec<_>) = channels
        .into_iter()
        .partition(|c| c.channel_type() == Some(ChannelType::GuildCategory));
    rest.extend(categories);
    rest
}

/// Delete every channel of the guild.
pub async fn reset_channels(rest: &Rest, guild_id: &str) -> Result<(), CloneError> {
    let Some(channels) = list_channels(rest, guild_id).await? else {
        return Ok(());
    };

    for channel in deletion_order(channels) {
        let what = format!("deleting channel {}", channel.display_name());
        let deleted = rest
            .call(&what, &Route::delete_channel(&channel.id), &Body::Empty)
            .await?;
        if deleted.is_some() {
            rest.stats().bump(Counter::ChannelsDeleted);
            rest.log()
                .info(format!("Channel deleted: {}", channel.display_name()));
        }
        rest.pace().await?;
    }
    Ok(())
}
