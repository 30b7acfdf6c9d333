//! Typed representations of the Discord REST objects the cloner reads and
//! writes.
//!
//! Only the fields the engine needs are modelled. REST responses are
//! deserialized into these structs at the HTTP boundary so the rest of the
//! crate never touches `serde_json::Value`.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_repr::{Deserialize_repr, Serialize_repr};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Discord IDs are snowflakes transmitted as strings in JSON.
pub type Snowflake = String;

bitflags! {
    /// Permission bitmask. Discord sends it as a decimal string.
    ///
    /// Only a few named flags are declared; unknown bits are retained so a
    /// bitmask survives the round trip from source to destination unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permissions: u64 {
        const CREATE_INSTANT_INVITE = 1 << 0;
        const KICK_MEMBERS = 1 << 1;
        const BAN_MEMBERS = 1 << 2;
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_GUILD = 1 << 5;
        const VIEW_CHANNEL = 1 << 10;
        const SEND_MESSAGES = 1 << 11;
        const MANAGE_MESSAGES = 1 << 13;
        const ATTACH_FILES = 1 << 15;
        const READ_MESSAGE_HISTORY = 1 << 16;
        const MENTION_EVERYONE = 1 << 17;
        const CONNECT = 1 << 20;
        const SPEAK = 1 << 21;
        const MANAGE_ROLES = 1 << 28;
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.bits().to_string())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Older payloads sometimes carry the bitmask as a bare integer.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Int(u64),
        }

        let bits = match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s
                .parse::<u64>()
                .map_err(<D::Error as serde::de::Error>::custom)?,
            Raw::Int(n) => n,
        };
        Ok(Permissions::from_bits_retain(bits))
    }
}

// ---------------------------------------------------------------------------
// Guild
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Guild {
    pub id: Snowflake,
    pub name: String,
    pub icon: Option<String>,
}

/// CDN URL for a guild icon hash.
pub fn icon_url(guild_id: &str, hash: &str) -> String {
    format!("https://cdn.discordapp.com/icons/{}/{}.png", guild_id, hash)
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Role {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub permissions: Permissions,
    /// Integration / bot roles. The API refuses to delete these.
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub mentionable: bool,
}

impl Role {
    /// The everyone role shares its id with the guild.
    pub fn is_everyone(&self, guild_id: &str) -> bool {
        self.id == guild_id || self.name == "@everyone"
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum ChannelType {
    GuildText = 0,
    Dm = 1,
    GuildVoice = 2,
    GroupDm = 3,
    GuildCategory = 4,
    GuildAnnouncement = 5,
    AnnouncementThread = 10,
    PublicThread = 11,
    PrivateThread = 12,
    GuildStageVoice = 13,
    GuildDirectory = 14,
    GuildForum = 15,
    GuildMedia = 16,
}

impl TryFrom<u8> for ChannelType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::GuildText,
            1 => Self::Dm,
            2 => Self::GuildVoice,
            3 => Self::GroupDm,
            4 => Self::GuildCategory,
            5 => Self::GuildAnnouncement,
            10 => Self::AnnouncementThread,
            11 => Self::PublicThread,
            12 => Self::PrivateThread,
            13 => Self::GuildStageVoice,
            14 => Self::GuildDirectory,
            15 => Self::GuildForum,
            16 => Self::GuildMedia,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum OverwriteType {
    Role = 0,
    Member = 1,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PermissionOverwrite {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: OverwriteType,
    #[serde(default)]
    pub allow: Permissions,
    #[serde(default)]
    pub deny: Permissions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    pub id: Snowflake,
    /// Raw channel type. Kept as an integer so that channel types newer than
    /// [`ChannelType`] do not fail the whole channel list.
    #[serde(rename = "type")]
    pub kind: u8,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub position: Option<i64>,
    pub parent_id: Option<Snowflake>,
    #[serde(default)]
    pub nsfw: bool,
    pub rate_limit_per_user: Option<u32>,
    pub bitrate: Option<u32>,
    pub user_limit: Option<u32>,
    #[serde(default)]
    pub permission_overwrites: Vec<PermissionOverwrite>,
}

impl Channel {
    /// The typed channel kind, or `None` for types this crate doesn't know.
    pub fn channel_type(&self) -> Option<ChannelType> {
        ChannelType::try_from(self.kind).ok()
    }

    /// Channel name, or `"?"` when absent.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("?")
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// The name shown in the client: the global display name if set,
    /// otherwise the username.
    pub fn display_name(&self) -> &str {
        self.global_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub author: User,
    #[serde(default)]
    pub content: String,
    /// ISO8601 timestamp.
    pub timestamp: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    pub url: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Minimal view of a freshly created entity: only the new id matters.
#[derive(Debug, Clone, Deserialize)]
pub struct Created {
    pub id: Snowflake,
}

/// Body of a 429 response.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitBody {
    /// Seconds to wait before retrying.
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
}

// ---------------------------------------------------------------------------
// Outbound bodies
// ---------------------------------------------------------------------------

/// Body for `PATCH /guilds/{guild_id}`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EditGuild {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Data URI (`data:image/png;base64,...`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Body for `POST /guilds/{guild_id}/roles`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRole {
    pub name: String,
    pub permissions: Permissions,
    pub color: u32,
    pub hoist: bool,
    pub mentionable: bool,
}

/// Body for `POST /guilds/{guild_id}/channels`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateChannel {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Snowflake>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsfw: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_user: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_limit: Option<u32>,
    pub permission_overwrites: Vec<PermissionOverwrite>,
}

impl CreateChannel {
    /// A bare channel of `kind` with no optional attributes set.
    pub fn new(name: impl Into<String>, kind: ChannelType) -> Self {
        Self {
            name: name.into(),
            kind,
            position: None,
            parent_id: None,
            topic: None,
            nsfw: None,
            rate_limit_per_user: None,
            bitrate: None,
            user_limit: None,
            permission_overwrites: Vec::new(),
        }
    }
}

/// Body for `POST /channels/{channel_id}/messages`.
///
/// Copied messages never ping anyone, so `allowed_mentions` is always sent
/// with an empty parse list.
#[derive(Debug, Clone, Serialize)]
pub struct CreateMessage {
    pub content: String,
    pub allowed_mentions: AllowedMentions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentSlot>,
}

impl CreateMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            allowed_mentions: AllowedMentions::default(),
            attachments: Vec::new(),
        }
    }

    /// Declare an uploaded file. `id` is the index used in the `files[n]`
    /// multipart field.
    pub fn attachment(mut self, id: u32, filename: impl Into<String>) -> Self {
        self.attachments.push(AttachmentSlot {
            id,
            filename: filename.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentSlot {
    pub id: u32,
    pub filename: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
