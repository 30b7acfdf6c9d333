//! Domain records for one clone run.
//!
//! The fetcher converts wire types from [`crate::types`] into these specs;
//! everything after the fetch boundary works on them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{Channel, Guild, OverwriteType, PermissionOverwrite, Permissions, Role, Snowflake};

// ---------------------------------------------------------------------------
// Guild identity
// ---------------------------------------------------------------------------

/// Identity of a source or destination guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSnapshot {
    pub id: Snowflake,
    pub name: String,
    /// Icon hash, as returned by the API.
    pub icon_ref: Option<String>,
}

impl GuildSnapshot {
    pub fn new(id: impl Into<Snowflake>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon_ref: None,
        }
    }

    pub fn with_icon(mut self, icon_ref: impl Into<String>) -> Self {
        self.icon_ref = Some(icon_ref.into());
        self
    }
}

impl From<Guild> for GuildSnapshot {
    fn from(guild: Guild) -> Self {
        Self {
            id: guild.id,
            name: guild.name,
            icon_ref: guild.icon,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub source_id: Snowflake,
    pub name: String,
    pub permissions: Permissions,
    pub color: u32,
    pub hoist: bool,
    pub mentionable: bool,
    pub position: i64,
}

impl From<&Role> for RoleSpec {
    fn from(role: &Role) -> Self {
        Self {
            source_id: role.id.clone(),
            name: role.name.clone(),
            permissions: role.permissions,
            color: role.color,
            hoist: role.hoist,
            mentionable: role.mentionable,
            position: role.position,
        }
    }
}

/// A role-targeted permission exception. Member overwrites are not carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overwrite {
    pub role_id: Snowflake,
    pub allow: Permissions,
    pub deny: Permissions,
}

/// Keep only role overwrites.
fn role_overwrites(raw: &[PermissionOverwrite]) -> Vec<Overwrite> {
    raw.iter()
        .filter(|o| o.kind == OverwriteType::Role)
        .map(|o| Overwrite {
            role_id: o.id.clone(),
            allow: o.allow,
            deny: o.deny,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySpec {
    pub source_id: Snowflake,
    pub name: String,
    pub position: i64,
    pub overwrites: Vec<Overwrite>,
}

impl From<&Channel> for CategorySpec {
    fn from(channel: &Channel) -> Self {
        Self {
            source_id: channel.id.clone(),
            name: channel.display_name().to_string(),
            position: channel.position.unwrap_or(0),
            overwrites: role_overwrites(&channel.permission_overwrites),
        }
    }
}

/// Attributes specific to one channel kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Text {
        topic: Option<String>,
        nsfw: bool,
        slowmode: Option<u32>,
    },
    Voice {
        bitrate: Option<u32>,
        user_limit: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub source_id: Snowflake,
    pub name: String,
    pub position: i64,
    pub parent_category_source_id: Option<Snowflake>,
    pub overwrites: Vec<Overwrite>,
    pub kind: ChannelKind,
}

impl ChannelSpec {
    pub fn text(channel: &Channel) -> Self {
        Self::with_kind(
            channel,
            ChannelKind::Text {
                topic: channel.topic.clone(),
                nsfw: channel.nsfw,
                slowmode: channel.rate_limit_per_user,
            },
        )
    }

    pub fn voice(channel: &Channel) -> Self {
        Self::with_kind(
            channel,
            ChannelKind::Voice {
                bitrate: channel.bitrate,
                user_limit: channel.user_limit,
            },
        )
    }

    fn with_kind(channel: &Channel, kind: ChannelKind) -> Self {
        Self {
            source_id: channel.id.clone(),
            name: channel.display_name().to_string(),
            position: channel.position.unwrap_or(0),
            parent_category_source_id: channel.parent_id.clone(),
            overwrites: role_overwrites(&channel.permission_overwrites),
            kind,
        }
    }

    pub fn is_voice(&self) -> bool {
        matches!(self.kind, ChannelKind::Voice { .. })
    }
}

// ---------------------------------------------------------------------------
// Identity map
// ---------------------------------------------------------------------------

/// Source-id → destination-id translation tables built during creation.
///
/// A missing key means the entity was not created (disabled or failed).
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    roles: HashMap<Snowflake, Snowflake>,
    categories: HashMap<Snowflake, Snowflake>,
    channels: HashMap<Snowflake, Snowflake>,
}

impl IdentityMap {
    /// A map whose only entry pairs the two everyone roles. The everyone
    /// role's id is its guild's id, so it can be mapped without creating it.
    pub fn new(source_guild_id: &str, dest_guild_id: &str) -> Self {
        let mut map = Self::default();
        map.roles
            .insert(source_guild_id.to_string(), dest_guild_id.to_string());
        map
    }

    pub fn insert_role(&mut self, source: Snowflake, dest: Snowflake) {
        self.roles.insert(source, dest);
    }

    pub fn insert_category(&mut self, source: Snowflake, dest: Snowflake) {
        self.categories.insert(source, dest);
    }

    pub fn insert_channel(&mut self, source: Snowflake, dest: Snowflake) {
        self.channels.insert(source, dest);
    }

    pub fn role(&self, source: &str) -> Option<&Snowflake> {
        self.roles.get(source)
    }

    pub fn category(&self, source: &str) -> Option<&Snowflake> {
        self.categories.get(source)
    }

    pub fn channel(&self, source: &str) -> Option<&Snowflake> {
        self.channels.get(source)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_messages_limit() -> u32 {
    CloneOptions::DEFAULT_MESSAGES_LIMIT
}

/// What a single run clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneOptions {
    #[serde(default = "default_true")]
    pub clone_roles: bool,
    #[serde(default = "default_true")]
    pub clone_categories: bool,
    #[serde(default = "default_true")]
    pub clone_text_channels: bool,
    #[serde(default = "default_true")]
    pub clone_voice_channels: bool,
    #[serde(default = "default_true")]
    pub clone_messages: bool,
    #[serde(default = "default_true")]
    pub clone_name_icon: bool,
    /// Most recent messages copied per text channel.
    #[serde(default = "default_messages_limit")]
    pub messages_limit: u32,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            clone_roles: true,
            clone_categories: true,
            clone_text_channels: true,
            clone_voice_channels: true,
            clone_messages: true,
            clone_name_icon: true,
            messages_limit: Self::DEFAULT_MESSAGES_LIMIT,
        }
    }
}

impl CloneOptions {
    pub const DEFAULT_MESSAGES_LIMIT: u32 = 50;

    /// Every flag off. Useful as a base for struct-update syntax.
    pub fn none() -> Self {
        Self {
            clone_roles: false,
            clone_categories: false,
            clone_text_channels: false,
            clone_voice_channels: false,
            clone_messages: false,
            clone_name_icon: false,
            messages_limit: Self::DEFAULT_MESSAGES_LIMIT,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clone_messages && self.messages_limit == 0 {
            return Err(ConfigError::ZeroMessagesLimit);
        }
        Ok(())
    }

    /// Whether any channel kind is cloned (and therefore channels reset).
    pub fn clones_channels(&self) -> bool {
        self.clone_categories || self.clone_text_channels || self.clone_voice_channels
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
