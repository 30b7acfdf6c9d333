//! Message replication.
//!
//! Recent history of each source text channel is re-posted in the matching
//! destination channel, oldest first, with the original author and time in a
//! header line. Channels are copied two at a time; each channel is one
//! sequential task with its own adaptive pacing and backoff sequence.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use crate::error::{CloneError, HttpError};
use crate::http::{Body, Route};
use crate::model::{ChannelSpec, IdentityMap};
use crate::rest::Rest;
use crate::sink::Logger;
use crate::stats::Counter;
use crate::types::{Channel, ChannelType, CreateMessage, Embed, Message, Snowflake};

/// Discord's content limit, in characters.
pub const MESSAGE_LIMIT: usize = 2000;
const CHANNEL_BATCH: usize = 2;
const PAGE_SIZE: usize = 100;

/// One source channel paired with its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    pub source_channel_id: Snowflake,
    pub dest_channel_id: Snowflake,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Pair source text channels with destination channels.
///
/// Channels created in this run are found through `ids`. When `dest_channels`
/// is given (text channels were not cloned), unmapped channels are matched by
/// name instead; a name that appears more than once on either side is
/// skipped.
pub fn plan_jobs(
    text_channels: &[ChannelSpec],
    ids: &IdentityMap,
    dest_channels: Option<&[Channel]>,
    log: &Logger,
) -> Vec<CopyJob> {
    let dest_by_name: HashMap<&str, Vec<&Channel>> = dest_channels
        .unwrap_or_default()
        .iter()
        .filter(|c| {
            matches!(
                c.channel_type(),
                Some(ChannelType::GuildText | ChannelType::GuildAnnouncement)
            )
        })
        .fold(HashMap::new(), |mut map, c| {
            map.entry(c.display_name()).or_default().push(c);
            map
        });
    let mut source_names: HashMap<&str, usize> = HashMap::new();
    for spec in text_channels {
        *source_names.entry(spec.name.as_str()).or_default() += 1;
    }

    let mut jobs = Vec::new();
    for spec in text_channels {
        if let Some(dest) = ids.channel(&spec.source_id) {
            jobs.push(CopyJob {
                source_channel_id: spec.source_id.clone(),
                dest_channel_id: dest.clone(),
                name: spec.name.clone(),
            });
            continue;
        }
        if dest_channels.is_none() {
            continue;
        }
        match dest_by_name.get(spec.name.as_str()).map(Vec::as_slice) {
            Some([dest]) if source_names[spec.name.as_str()] == 1 => jobs.push(CopyJob {
                source_channel_id: spec.source_id.clone(),
                dest_channel_id: dest.id.clone(),
                name: spec.name.clone(),
            }),
            Some(_) => log.error(format!(
                "Skipping messages of #{}: channel name is ambiguous",
                spec.name
            )),
            None => log.info(format!(
                "Skipping messages of #{}: no matching destination channel",
                spec.name
            )),
        }
    }
    jobs
}

// ---------------------------------------------------------------------------
// Message synthesis
// ---------------------------------------------------------------------------

/// `**title**` and description lines of every embed.
pub fn flatten_embeds(embeds: &[Embed]) -> String {
    embeds
        .iter()
        .flat_map(|e| {
            let title = e.title.as_ref().map(|t| format!("**{}**", t));
            let description = e.description.clone();
            title.into_iter().chain(description)
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cut `text` to `max` characters, ending in `...` when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn format_timestamp(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc).format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Header line, content and flattened embeds, within [`MESSAGE_LIMIT`].
pub fn synthesize(message: &Message) -> String {
    let mut body = message.content.clone();
    let embeds = flatten_embeds(&message.embeds);
    if !embeds.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&embeds);
    }

    let text = format!(
        "**{}** ({})\n{}",
        message.author.display_name(),
        format_timestamp(&message.timestamp),
        body
    );
    truncate(text.trim_end(), MESSAGE_LIMIT)
}

/// System messages (joins, pins) carry nothing worth copying.
fn is_empty(message: &Message) -> bool {
    message.content.trim().is_empty()
        && message.attachments.is_empty()
        && flatten_embeds(&message.embeds).is_empty()
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Per-channel send delay: eases off after successes, doubles after failures.
#[derive(Debug, Clone)]
struct Pacer {
    delay: Duration,
    min: Duration,
    max: Duration,
}

impl Pacer {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            delay: base,
            min: base / 2,
            max: max.max(base),
        }
    }

    fn success(&mut self) {
        self.delay = (self.delay * 9 / 10).max(self.min);
    }

    fn failure(&mut self) {
        self.delay = (self.delay * 2).min(self.max);
    }
}

// ---------------------------------------------------------------------------
// Copying
// ---------------------------------------------------------------------------

/// Up to `limit` most recent messages, oldest first.
async fn fetch_history(
    rest: &Rest,
    job: &CopyJob,
    limit: usize,
) -> Result<Vec<Message>, CloneError> {
    let mut messages: Vec<Message> = Vec::new();
    let mut before: Option<Snowflake> = None;

    while messages.len() < limit {
        let want = (limit - messages.len()).min(PAGE_SIZE);
        let query = match &before {
            Some(id) => format!("limit={}&before={}", want, id),
            None => format!("limit={}", want),
        };
        let what = format!("fetching messages of #{}", job.name);
        let route = Route::get_messages(&job.source_channel_id, &query);
        let Some(page) = rest
            .call_json::<Vec<Message>>(&what, &route, &Body::Empty)
            .await?
        else {
            break;
        };
        let full = page.len() >= want;
        before = page.last().map(|m| m.id.clone());
        messages.extend(page);
        if !full {
            break;
        }
    }

    messages.truncate(limit);
    messages.reverse();
    Ok(messages)
}

/// Download every attachment of `message`. Failed downloads are dropped.
async fn download_attachments(
    rest: &Rest,
    message: &Message,
) -> Result<Vec<(String, Vec<u8>)>, CloneError> {
    let mut files = Vec::new();
    for attachment in &message.attachments {
        let what = format!("downloading attachment {}", attachment.filename);
        if let Some(bytes) = rest
            .call(&what, &Route::download(&attachment.url), &Body::Empty)
            .await?
        {
            files.push((attachment.filename.clone(), bytes));
        }
    }
    Ok(files)
}

fn message_body(message: &Message, files: &[(String, Vec<u8>)]) -> Result<Body, CloneError> {
    let payload = files
        .iter()
        .enumerate()
        .fold(CreateMessage::new(synthesize(message)), |payload, (i, (name, _))| {
            payload.attachment(i as u32, name.clone())
        });
    if files.is_empty() {
        return Ok(Body::json(&payload)?);
    }
    let json = serde_json::to_string(&payload).map_err(|e| HttpError::Decode {
        route: "message payload".to_string(),
        message: e.to_string(),
    })?;
    Ok(Body::multipart(&json, files))
}

/// Copy one channel, returning the number of messages posted.
async fn copy_channel(rest: &Rest, job: &CopyJob, limit: usize) -> Result<u64, CloneError> {
    rest.log()
        .info(format!("Copying messages from channel: {}", job.name));
    let history = fetch_history(rest, job, limit).await?;

    let route = Route::create_message(&job.dest_channel_id);
    let mut pacer = Pacer::new(rest.policy().write_delay, rest.policy().transport_backoff_max);
    let mut copied = 0;

    for message in history.iter().filter(|m| !is_empty(m)) {
        let files = download_attachments(rest, message).await?;
        let body = message_body(message, &files)?;
        let what = format!("copying message {} to #{}", message.id, job.name);
        if rest.call(&what, &route, &body).await?.is_some() {
            rest.stats().bump(Counter::MessagesCopied);
            copied += 1;
            pacer.success();
        } else {
            pacer.failure();
        }
        rest.pause(pacer.delay).await?;
    }

    rest.log()
        .info(format!("Copied {} messages to #{}", copied, job.name));
    Ok(copied)
}

/// Copy every job, [`CHANNEL_BATCH`] channels at a time.
///
/// The first fatal error of a batch is returned once the whole batch has
/// finished.
pub async fn copy_messages(rest: &Rest, jobs: &[CopyJob], limit: u32) -> Result<(), CloneError> {
    rest.log().info("Starting message copy...");
    let limit = limit as usize;

    for batch in jobs.chunks(CHANNEL_BATCH) {
        rest.cancel_token().check()?;

        let mut tasks = JoinSet::new();
        for job in batch {
            let rest = rest.sequence();
            let job = job.clone();
            tasks.spawn(async move { copy_channel(&rest, &job, limit).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| CloneError::Task(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
    }
    Ok(())
}
