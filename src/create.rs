//! Creates roles, categories and channels in the destination guild.
//!
//! Each pass walks its specs in order, one REST call per entity, and records
//! the new ids in the [`IdentityMap`] so later passes can translate parent
//! and overwrite references. A failed entity is skipped; anything pointing at
//! it falls back to "no parent" / "no overwrite".

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::CloneError;
use crate::http::{Body, Route};
use crate::model::{CategorySpec, ChannelKind, ChannelSpec, GuildSnapshot, IdentityMap, Overwrite, RoleSpec};
use crate::rest::Rest;
use crate::stats::Counter;
use crate::types::{
    icon_url, ChannelType, CreateChannel, CreateRole, Created, EditGuild, OverwriteType,
    PermissionOverwrite,
};

/// Lowest bitrate Discord accepts for a voice channel.
const MIN_BITRATE: u32 = 8000;

// ---------------------------------------------------------------------------
// Guild
// ---------------------------------------------------------------------------

/// Copy the source guild's name and icon onto the destination.
pub async fn edit_guild(
    rest: &Rest,
    source: &GuildSnapshot,
    dest: &GuildSnapshot,
) -> Result<(), CloneError> {
    let mut edit = EditGuild {
        name: Some(source.name.clone()),
        icon: None,
    };

    if let Some(hash) = &source.icon_ref {
        let url = icon_url(&source.id, hash);
        if let Some(bytes) = rest
            .call("downloading guild icon", &Route::download(&url), &Body::Empty)
            .await?
        {
            edit.icon = Some(format!("data:image/png;base64,{}", STANDARD.encode(bytes)));
        }
    }

    let updated = rest
        .call(
            &format!("updating guild {}", dest.name),
            &Route::edit_guild(&dest.id),
            &Body::json(&edit)?,
        )
        .await?;
    if updated.is_some() {
        rest.log().info(format!(
            "Guild name{} updated: {}",
            if edit.icon.is_some() { " and icon" } else { "" },
            source.name
        ));
    }
    rest.pace().await
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Create `roles` in list order.
pub async fn create_roles(
    rest: &Rest,
    guild_id: &str,
    roles: &[RoleSpec],
    ids: &mut IdentityMap,
) -> Result<(), CloneError> {
    let route = Route::create_role(guild_id);
    for spec in roles {
        let body = Body::json(&CreateRole {
            name: spec.name.clone(),
            permissions: spec.permissions,
            color: spec.color,
            hoist: spec.hoist,
            mentionable: spec.mentionable,
        })?;
        let what = format!("creating role {}", spec.name);
        if let Some(created) = rest.call_json::<Created>(&what, &route, &body).await? {
            ids.insert_role(spec.source_id.clone(), created.id);
            let n = rest.stats().bump(Counter::RolesCreated);
            rest.log().info(format!(
                "Role created ({}/{}): {}",
                n,
                rest.stats().total_roles(),
                spec.name
            ));
        }
        rest.pace().await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Categories and channels
// ---------------------------------------------------------------------------

/// Translate overwrites to destination role ids, dropping unmapped roles.
pub fn remap_overwrites(overwrites: &[Overwrite], ids: &IdentityMap) -> Vec<PermissionOverwrite> {
    overwrites
        .iter()
        .filter_map(|o| {
            ids.role(&o.role_id).map(|id| PermissionOverwrite {
                id: id.clone(),
                kind: OverwriteType::Role,
                allow: o.allow,
                deny: o.deny,
            })
        })
        .collect()
}

/// Stable sort by position; ties keep fetch order.
fn by_position<T>(items: &[T], position: impl Fn(&T) -> i64) -> Vec<&T> {
    let mut sorted: Vec<&T> = items.iter().collect();
    sorted.sort_by_key(|item| position(item));
    sorted
}

pub fn category_request(spec: &CategorySpec, ids: &IdentityMap) -> CreateChannel {
    CreateChannel {
        position: Some(spec.position),
        permission_overwrites: remap_overwrites(&spec.overwrites, ids),
        ..CreateChannel::new(spec.name.clone(), ChannelType::GuildCategory)
    }
}

pub fn channel_request(spec: &ChannelSpec, ids: &IdentityMap) -> CreateChannel {
    let parent_id = spec
        .parent_category_source_id
        .as_deref()
        .and_then(|p| ids.category(p))
        .cloned();

    let mut request = match &spec.kind {
        ChannelKind::Text {
            topic,
            nsfw,
            slowmode,
        } => CreateChannel {
            topic: topic.clone(),
            nsfw: Some(*nsfw),
            rate_limit_per_user: *slowmode,
            ..CreateChannel::new(spec.name.clone(), ChannelType::GuildText)
        },
        ChannelKind::Voice {
            bitrate,
            user_limit,
        } => CreateChannel {
            bitrate: bitrate.map(|b| b.max(MIN_BITRATE)),
            user_limit: *user_limit,
            ..CreateChannel::new(spec.name.clone(), ChannelType::GuildVoice)
        },
    };
    request.position = Some(spec.position);
    request.parent_id = parent_id;
    request.permission_overwrites = remap_overwrites(&spec.overwrites, ids);
    request
}

/// Create categories sorted by position and record their ids.
pub async fn create_categories(
    rest: &Rest,
    guild_id: &str,
    categories: &[CategorySpec],
    ids: &mut IdentityMap,
) -> Result<(), CloneError> {
    let route = Route::create_channel(guild_id);
    for spec in by_position(categories, |c| c.position) {
        let body = Body::json(&category_request(spec, ids))?;
        let what = format!("creating category {}", spec.name);
        if let Some(created) = rest.call_json::<Created>(&what, &route, &body).await? {
            ids.insert_category(spec.source_id.clone(), created.id);
            rest.stats().bump(Counter::CategoriesCreated);
            rest.log().info(format!(
                "Category created ({}/{}): {}",
                created_channels(rest),
                rest.stats().total_channels(),
                spec.name
            ));
        }
        rest.pace().await?;
    }
    Ok(())
}

/// Create text or voice channels sorted by position, parented through the
/// category map.
pub async fn create_channels(
    rest: &Rest,
    guild_id: &str,
    channels: &[ChannelSpec],
    ids: &mut IdentityMap,
) -> Result<(), CloneError> {
    let route = Route::create_channel(guild_id);
    for spec in by_position(channels, |c| c.position) {
        let (label, title, counter) = if spec.is_voice() {
            ("voice channel", "Voice channel", Counter::VoiceChannelsCreated)
        } else {
            ("text channel", "Text channel", Counter::TextChannelsCreated)
        };
        let body = Body::json(&channel_request(spec, ids))?;
        let what = format!("creating {} {}", label, spec.name);
        if let Some(created) = rest.call_json::<Created>(&what, &route, &body).await? {
            ids.insert_channel(spec.source_id.clone(), created.id);
            rest.stats().bump(counter);
            rest.log().info(format!(
                "{} created ({}/{}): {}",
                title,
                created_channels(rest),
                rest.stats().total_channels(),
                spec.name
            ));
        }
        rest.pace().await?;
    }
    Ok(())
}

fn created_channels(rest: &Rest) -> u64 {
    rest.stats().snapshot().channels_created()
}
