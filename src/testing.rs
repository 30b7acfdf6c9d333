//! In-memory Discord used by the unit tests.
//!
//! [`FakeDiscord`] implements [`Transport`] over a tiny guild model: roles,
//! channels, messages and CDN files. It records every call in order and can
//! be scripted to fail the nth call on a route.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::error::HttpError;
use crate::http::{ApiRequest, ApiResponse, Body, ClientConfig, DiscordHttpClient, Transport};
use crate::rest::{Rest, RetryPolicy};
use crate::sink::{LogLevel, LogSink, Logger};
use crate::stats::StatsTracker;
use crate::types::{
    Attachment, Channel, ChannelType, Guild, Message, OverwriteType, PermissionOverwrite,
    Permissions, Role, User,
};

pub(crate) const BASE: &str = "http://fake.test/api";

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum FaultKind {
    RateLimit(f64),
    Status(u16),
    Transport,
    Body(String),
}

/// Replace the `nth` (1-based) call to `method path` with a canned outcome.
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    method: String,
    path: String,
    nth: usize,
    kind: FaultKind,
}

impl Fault {
    fn new(method: &str, path: &str, nth: usize, kind: FaultKind) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            nth,
            kind,
        }
    }

    pub fn rate_limit(method: &str, path: &str, nth: usize, retry_after: f64) -> Self {
        Self::new(method, path, nth, FaultKind::RateLimit(retry_after))
    }

    pub fn status(method: &str, path: &str, nth: usize, status: u16) -> Self {
        Self::new(method, path, nth, FaultKind::Status(status))
    }

    pub fn transport(method: &str, path: &str, nth: usize) -> Self {
        Self::new(method, path, nth, FaultKind::Transport)
    }

    pub fn body(method: &str, path: &str, nth: usize, body: &str) -> Self {
        Self::new(method, path, nth, FaultKind::Body(body.to_string()))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeGuild {
    pub name: String,
    pub icon: Option<String>,
    pub roles: Vec<Role>,
    pub channels: Vec<Channel>,
}

impl FakeGuild {
    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    pub fn channel_named(&self, name: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
    }

    /// `(name, type, parent name)` for every channel, sorted.
    pub fn structure(&self) -> Vec<(String, u8, Option<String>)> {
        let mut out: Vec<_> = self
            .channels
            .iter()
            .map(|c| {
                let parent = c.parent_id.as_ref().and_then(|p| {
                    self.channels
                        .iter()
                        .find(|x| &x.id == p)
                        .map(|x| x.display_name().to_string())
                });
                (c.display_name().to_string(), c.kind, parent)
            })
            .collect();
        out.sort();
        out
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    /// Number of uploaded files for multipart requests.
    pub files: Vec<String>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    guilds: BTreeMap<String, FakeGuild>,
    /// Channel id → messages, oldest first.
    messages: HashMap<String, Vec<Message>>,
    files: HashMap<String, Vec<u8>>,
    faults: Vec<Fault>,
    hits: HashMap<(String, String), usize>,
    calls: Vec<Call>,
}

impl State {
    fn id(&mut self) -> String {
        self.next_id += 1;
        (1_000_000 + self.next_id).to_string()
    }

    fn guild_of_channel(&mut self, channel_id: &str) -> Option<&mut FakeGuild> {
        self.guilds
            .values_mut()
            .find(|g| g.channels.iter().any(|c| c.id == channel_id))
    }
}

#[derive(Default)]
struct Recorder {
    entries: Mutex<Vec<(String, LogLevel)>>,
}

impl LogSink for Recorder {
    fn log(&self, message: &str, level: LogLevel) {
        self.entries
            .lock()
            .unwrap()
            .push((message.to_string(), level));
    }
}

pub(crate) struct FakeDiscord {
    state: Mutex<State>,
    logs: Arc<Recorder>,
}

// ---------------------------------------------------------------------------
// Setup and inspection
// ---------------------------------------------------------------------------

impl FakeDiscord {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            logs: Arc::new(Recorder::default()),
        })
    }

    pub fn client(self: &Arc<Self>) -> DiscordHttpClient {
        DiscordHttpClient::new(
            ClientConfig::new("test-token").base_url(BASE),
            Arc::clone(self) as Arc<dyn Transport>,
        )
    }

    /// A sink that records into [`logs`](Self::logs).
    pub fn sink(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.logs) as Arc<dyn LogSink>
    }

    pub fn logger(&self) -> Logger {
        Logger::new(self.sink())
    }

    pub fn rest(self: &Arc<Self>, policy: RetryPolicy) -> Rest {
        Rest::new(
            self.client(),
            Arc::new(StatsTracker::new()),
            self.logger(),
            CancelToken::new(),
            policy,
        )
    }

    pub fn logs(&self) -> Vec<(String, LogLevel)> {
        self.logs.entries.lock().unwrap().clone()
    }

    pub fn has_log(&self, level: LogLevel, needle: &str) -> bool {
        self.logs()
            .iter()
            .any(|(msg, l)| *l == level && msg.contains(needle))
    }

    pub fn add_guild(&self, id: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.guilds.insert(
            id.to_string(),
            FakeGuild {
                name: name.to_string(),
                icon: None,
                roles: vec![role(id, "@everyone", 0)],
                channels: Vec::new(),
            },
        );
    }

    pub fn set_icon(&self, guild: &str, hash: &str) {
        self.with_guild(guild, |g| g.icon = Some(hash.to_string()));
    }

    pub fn add_role(&self, guild: &str, id: &str, name: &str, position: i64) {
        self.with_guild(guild, |g| g.roles.push(role(id, name, position)));
    }

    pub fn add_managed_role(&self, guild: &str, id: &str, name: &str) {
        let mut r = role(id, name, 1);
        r.managed = true;
        self.with_guild(guild, |g| g.roles.push(r));
    }

    pub fn add_channel(&self, guild: &str, channel: Channel) {
        self.with_guild(guild, |g| g.channels.push(channel));
    }

    pub fn add_category(&self, guild: &str, id: &str, name: &str, position: i64) {
        self.add_channel(guild, channel(id, ChannelType::GuildCategory as u8, name, position, None));
    }

    pub fn add_text(&self, guild: &str, id: &str, name: &str, position: i64, parent: Option<&str>) {
        self.add_channel(guild, channel(id, ChannelType::GuildText as u8, name, position, parent));
    }

    pub fn add_voice(&self, guild: &str, id: &str, name: &str, position: i64, parent: Option<&str>) {
        let mut ch = channel(id, ChannelType::GuildVoice as u8, name, position, parent);
        ch.bitrate = Some(64000);
        ch.user_limit = Some(0);
        self.add_channel(guild, ch);
    }

    /// Append a message authored by `author` (chronological order).
    pub fn add_message(&self, channel_id: &str, author: &str, content: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.id();
        let msg = message(&id, channel_id, author, content, Vec::new());
        state
            .messages
            .entry(channel_id.to_string())
            .or_default()
            .push(msg);
        id
    }

    pub fn add_message_with(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .entry(message.channel_id.clone())
            .or_default()
            .push(message);
    }

    pub fn add_file(&self, url: &str, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(url.to_string(), bytes.to_vec());
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().unwrap().faults.push(fault);
    }

    pub fn guild(&self, id: &str) -> FakeGuild {
        self.state.lock().unwrap().guilds[id].clone()
    }

    pub fn messages(&self, channel_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, method: &str, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    /// `name` fields of every successful-or-not POST body to `path`, in order.
    pub fn posted_names(&self, path: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.method == "POST" && c.path == path)
            .filter_map(|c| c.body.as_ref()?.get("name")?.as_str().map(str::to_string))
            .collect()
    }

    fn with_guild(&self, guild: &str, f: impl FnOnce(&mut FakeGuild)) {
        let mut state = self.state.lock().unwrap();
        f(state.guilds.get_mut(guild).expect("unknown guild"));
    }
}

pub(crate) fn role(id: &str, name: &str, position: i64) -> Role {
    Role {
        id: id.to_string(),
        name: name.to_string(),
        color: 0,
        hoist: false,
        position,
        permissions: Permissions::empty(),
        managed: false,
        mentionable: false,
    }
}

pub(crate) fn channel(id: &str, kind: u8, name: &str, position: i64, parent: Option<&str>) -> Channel {
    Channel {
        id: id.to_string(),
        kind,
        name: Some(name.to_string()),
        topic: None,
        position: Some(position),
        parent_id: parent.map(str::to_string),
        nsfw: false,
        rate_limit_per_user: None,
        bitrate: None,
        user_limit: None,
        permission_overwrites: Vec::new(),
    }
}

pub(crate) fn message(
    id: &str,
    channel_id: &str,
    author: &str,
    content: &str,
    attachments: Vec<Attachment>,
) -> Message {
    Message {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        author: User {
            id: format!("u-{}", author),
            username: author.to_string(),
            global_name: None,
            bot: false,
        },
        content: content.to_string(),
        timestamp: "2024-03-01T12:30:00.000000+00:00".to_string(),
        attachments,
        embeds: Vec::new(),
    }
}

pub(crate) fn role_overwrite(role_id: &str, allow: Permissions) -> PermissionOverwrite {
    PermissionOverwrite {
        id: role_id.to_string(),
        kind: OverwriteType::Role,
        allow,
        deny: Permissions::empty(),
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

fn ok(value: Value) -> ApiResponse {
    ApiResponse::new(200, serde_json::to_vec(&value).unwrap())
}

fn status(code: u16, message: &str) -> ApiResponse {
    ApiResponse::new(code, serde_json::to_vec(&json!({ "message": message })).unwrap())
}

/// Pull the `payload_json` part and file names out of a multipart body.
fn parse_multipart(bytes: &[u8]) -> (Option<Value>, Vec<String>) {
    let text = String::from_utf8_lossy(bytes);
    let payload = text.find("name=\"payload_json\"").and_then(|start| {
        let rest = &text[start..];
        let body_start = rest.find("\r\n\r\n")? + 4;
        let body_end = rest[body_start..].find("\r\n--")? + body_start;
        serde_json::from_str(&rest[body_start..body_end]).ok()
    });
    let files = text
        .match_indices("filename=\"")
        .filter_map(|(i, m)| {
            let rest = &text[i + m.len()..];
            rest.find('"').map(|end| rest[..end].to_string())
        })
        .collect();
    (payload, files)
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

impl FakeDiscord {
    fn handle(&self, request: ApiRequest) -> Result<ApiResponse, HttpError> {
        let mut state = self.state.lock().unwrap();

        let (path, query) = match request.url.strip_prefix(BASE) {
            Some(rest) => match rest.split_once('?') {
                Some((p, q)) => (p.to_string(), q.to_string()),
                None => (rest.to_string(), String::new()),
            },
            None => (request.url.clone(), String::new()),
        };
        let method = request.method.as_str().to_string();

        let (body, files) = match &request.body {
            Body::Empty => (None, Vec::new()),
            Body::Json(v) => (Some(v.clone()), Vec::new()),
            Body::Raw { bytes, .. } => parse_multipart(bytes),
        };
        state.calls.push(Call {
            method: method.clone(),
            path: path.clone(),
            body: body.clone(),
            files: files.clone(),
        });

        let hit = {
            let counter = state.hits.entry((method.clone(), path.clone())).or_insert(0);
            *counter += 1;
            *counter
        };
        let fault = state
            .faults
            .iter()
            .find(|f| f.method == method && f.path == path && f.nth == hit)
            .cloned();
        if let Some(fault) = fault {
            return match fault.kind {
                FaultKind::RateLimit(secs) => Ok(ApiResponse::new(
                    429,
                    serde_json::to_vec(&json!({
                        "message": "You are being rate limited.",
                        "retry_after": secs,
                        "global": false
                    }))
                    .unwrap(),
                )),
                FaultKind::Status(code) => Ok(status(code, "injected failure")),
                FaultKind::Transport => Err(HttpError::Transport("connection reset".into())),
                FaultKind::Body(text) => Ok(ApiResponse::new(200, text.into_bytes())),
            };
        }

        if !path.starts_with('/') {
            return Ok(match state.files.get(&path) {
                Some(bytes) => ApiResponse::new(200, bytes.clone()),
                None => status(404, "no such file"),
            });
        }

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let body = body.unwrap_or(Value::Null);

        Ok(match (method.as_str(), segments.as_slice()) {
            ("GET", ["guilds", g]) => match state.guilds.get(*g) {
                Some(guild) => {
                    let guild = Guild {
                        id: g.to_string(),
                        name: guild.name.clone(),
                        icon: guild.icon.clone(),
                    };
                    ok(json!(guild))
                }
                None => status(404, "Unknown Guild"),
            },
            ("PATCH", ["guilds", g]) => match state.guilds.get_mut(*g) {
                Some(guild) => {
                    if let Some(name) = body.get("name").and_then(Value::as_str) {
                        guild.name = name.to_string();
                    }
                    if let Some(icon) = body.get("icon").and_then(Value::as_str) {
                        guild.icon = Some(format!("uploaded-{}", icon.len()));
                    }
                    ok(json!({ "id": g, "name": guild.name, "icon": guild.icon }))
                }
                None => status(404, "Unknown Guild"),
            },
            ("GET", ["guilds", g, "roles"]) => match state.guilds.get(*g) {
                Some(guild) => ok(json!(guild.roles)),
                None => status(404, "Unknown Guild"),
            },
            ("POST", ["guilds", g, "roles"]) => {
                let id = state.id();
                match state.guilds.get_mut(*g) {
                    Some(guild) => {
                        let mut r = role(&id, body["name"].as_str().unwrap_or("new role"), 1);
                        r.permissions = serde_json::from_value(body["permissions"].clone())
                            .unwrap_or_default();
                        r.color = body["color"].as_u64().unwrap_or(0) as u32;
                        r.hoist = body["hoist"].as_bool().unwrap_or(false);
                        r.mentionable = body["mentionable"].as_bool().unwrap_or(false);
                        // New roles land directly above everyone.
                        for existing in guild.roles.iter_mut().filter(|x| x.position >= 1) {
                            existing.position += 1;
                        }
                        guild.roles.push(r.clone());
                        ok(json!(r))
                    }
                    None => status(404, "Unknown Guild"),
                }
            }
            ("DELETE", ["guilds", g, "roles", r]) => match state.guilds.get_mut(*g) {
                Some(guild) => match guild.roles.iter().position(|x| x.id == *r) {
                    Some(_) if *r == *g => status(400, "Cannot delete everyone"),
                    Some(i) if guild.roles[i].managed => status(403, "Managed role"),
                    Some(i) => {
                        guild.roles.remove(i);
                        ApiResponse::new(204, Vec::new())
                    }
                    None => status(404, "Unknown Role"),
                },
                None => status(404, "Unknown Guild"),
            },
            ("GET", ["guilds", g, "channels"]) => match state.guilds.get(*g) {
                Some(guild) => ok(json!(guild.channels)),
                None => status(404, "Unknown Guild"),
            },
            ("POST", ["guilds", g, "channels"]) => {
                let id = state.id();
                match state.guilds.get_mut(*g) {
                    Some(guild) => {
                        let parent = body["parent_id"].as_str().map(str::to_string);
                        if let Some(p) = &parent {
                            let is_category = guild.channels.iter().any(|c| {
                                &c.id == p && c.kind == ChannelType::GuildCategory as u8
                            });
                            if !is_category {
                                return Ok(status(400, "Invalid parent"));
                            }
                        }
                        let overwrites: Vec<PermissionOverwrite> =
                            serde_json::from_value(body["permission_overwrites"].clone())
                                .unwrap_or_default();
                        if overwrites
                            .iter()
                            .any(|o| !guild.roles.iter().any(|r| r.id == o.id))
                        {
                            return Ok(status(400, "Unknown overwrite target"));
                        }
                        let mut ch = channel(
                            &id,
                            body["type"].as_u64().unwrap_or(0) as u8,
                            body["name"].as_str().unwrap_or("channel"),
                            body["position"].as_i64().unwrap_or(0),
                            parent.as_deref(),
                        );
                        ch.topic = body["topic"].as_str().map(str::to_string);
                        ch.nsfw = body["nsfw"].as_bool().unwrap_or(false);
                        ch.rate_limit_per_user =
                            body["rate_limit_per_user"].as_u64().map(|v| v as u32);
                        ch.bitrate = body["bitrate"].as_u64().map(|v| v as u32);
                        ch.user_limit = body["user_limit"].as_u64().map(|v| v as u32);
                        ch.permission_overwrites = overwrites;
                        guild.channels.push(ch.clone());
                        ok(json!(ch))
                    }
                    None => status(404, "Unknown Guild"),
                }
            }
            ("DELETE", ["channels", c]) => match state.guild_of_channel(c) {
                Some(guild) => {
                    let i = guild.channels.iter().position(|x| x.id == *c).unwrap();
                    let removed = guild.channels.remove(i);
                    ok(json!(removed))
                }
                None => status(404, "Unknown Channel"),
            },
            ("GET", ["channels", c, "messages"]) => {
                let limit = query_param(&query, "limit")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(50)
                    .min(100);
                let before = query_param(&query, "before").and_then(|v| v.parse::<u64>().ok());
                let all = state.messages.get(*c).cloned().unwrap_or_default();
                let mut page: Vec<Message> = all
                    .into_iter()
                    .filter(|m| before.map_or(true, |b| m.id.parse::<u64>().unwrap() < b))
                    .collect();
                page.reverse();
                page.truncate(limit);
                ok(json!(page))
            }
            ("POST", ["channels", c, "messages"]) => {
                let id = state.id();
                let content = body["content"].as_str().unwrap_or_default().to_string();
                let attachments = files
                    .iter()
                    .enumerate()
                    .map(|(i, name)| Attachment {
                        id: format!("{}-{}", id, i),
                        filename: name.clone(),
                        size: 0,
                        url: format!("https://cdn.test/{}/{}", id, name),
                        content_type: None,
                    })
                    .collect();
                let msg = message(&id, c, "cloner", &content, attachments);
                state
                    .messages
                    .entry(c.to_string())
                    .or_default()
                    .push(msg.clone());
                ok(json!(msg))
            }
            _ => status(404, "Unknown route"),
        })
    }
}

#[async_trait]
impl Transport for FakeDiscord {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, HttpError> {
        self.handle(request)
    }
}
