//! Timeline paging and payload extraction.
//!
//! The media timeline arrives as instruction lists. Posts can appear both as
//! plain timeline items and inside grid modules, and pagination threads a
//! bottom cursor between pages. Paging stops early when the platform stops
//! producing a bottom cursor or the cursor fails to advance.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::client::{GraphqlSourceClient, USER_MEDIA};
use super::{FetchDirection, MediaItem, MediaTimeline, Post, SourceError};
use crate::state::MediaType;

/// Timeline page size used by the web client.
const PAGE_SIZE: u32 = 20;

/// Format of `legacy.created_at` timestamps.
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

pub(crate) fn parse_user_id(body: &Value, handle: &str) -> Result<String, SourceError> {
    let result = body
        .pointer("/data/user/result")
        .ok_or_else(|| SourceError::parse(format!("no user result for @{handle}")))?;
    if result.get("__typename").and_then(Value::as_str) == Some("UserUnavailable") {
        return Err(SourceError::api(format!("user @{handle} is unavailable")));
    }
    result
        .get("rest_id")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| SourceError::parse(format!("no rest_id for @{handle}")))
}

/// Posts and bottom cursor extracted from one timeline page.
#[derive(Debug, Default)]
pub(crate) struct ParsedPage {
    pub posts: Vec<Post>,
    pub bottom_cursor: Option<String>,
}

/// Walk one response body and pull out media posts plus the bottom cursor.
pub(crate) fn parse_timeline_page(body: &Value, handle: &str) -> ParsedPage {
    let mut page = ParsedPage::default();

    let instructions = body
        .pointer("/data/user/result/timeline_v2/timeline/instructions")
        .or_else(|| body.pointer("/data/user/result/timeline/timeline/instructions"))
        .and_then(Value::as_array);
    let Some(instructions) = instructions else {
        return page;
    };

    for instruction in instructions {
        match instruction.get("type").and_then(Value::as_str) {
            Some("TimelineAddEntries") => {
                for entry in entries_of(instruction) {
                    collect_entry(entry, handle, &mut page);
                }
            }
            Some("TimelineAddToModule") => {
                for item in module_items_of(instruction) {
                    if let Some(post) = post_from_item(item, handle) {
                        page.posts.push(post);
                    }
                }
            }
            _ => {}
        }
    }

    page
}

fn entries_of(instruction: &Value) -> impl Iterator<Item = &Value> {
    instruction
        .get("entries")
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

fn module_items_of(instruction: &Value) -> impl Iterator<Item = &Value> {
    instruction
        .get("moduleItems")
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

fn collect_entry(entry: &Value, handle: &str, page: &mut ParsedPage) {
    let Some(content) = entry.get("content") else {
        return;
    };
    match content.get("entryType").and_then(Value::as_str) {
        Some("TimelineTimelineItem") => {
            if let Some(post) = content
                .get("itemContent")
                .and_then(|item| post_from_tweet_results(item.get("tweet_results"), handle))
            {
                page.posts.push(post);
            }
        }
        Some("TimelineTimelineModule") => {
            for item in content
                .get("items")
                .and_then(Value::as_array)
                .map(|a| a.iter())
                .into_iter()
                .flatten()
            {
                if let Some(post) = post_from_item(item, handle) {
                    page.posts.push(post);
                }
            }
        }
        Some("TimelineTimelineCursor") => {
            if content.get("cursorType").and_then(Value::as_str) == Some("Bottom") {
                page.bottom_cursor = content
                    .get("value")
                    .and_then(Value::as_str)
                    .map(String::from);
            }
        }
        _ => {}
    }
}

/// Module rows wrap the item content one level deeper than plain entries.
fn post_from_item(item: &Value, handle: &str) -> Option<Post> {
    let item_content = item
        .pointer("/item/itemContent")
        .or_else(|| item.get("itemContent"))?;
    post_from_tweet_results(item_content.get("tweet_results"), handle)
}

fn post_from_tweet_results(tweet_results: Option<&Value>, handle: &str) -> Option<Post> {
    let result = tweet_results?.get("result")?;
    let tweet = match result.get("__typename").and_then(Value::as_str) {
        Some("Tweet") => result,
        // Limited-visibility posts wrap the payload one level down.
        Some("TweetWithVisibilityResults") => result.get("tweet")?,
        _ => return None,
    };

    let id = tweet
        .get("rest_id")
        .and_then(Value::as_str)
        .or_else(|| tweet.pointer("/legacy/id_str").and_then(Value::as_str))?
        .to_string();
    let legacy = tweet.get("legacy")?;
    let media = extract_media(legacy);
    if media.is_empty() {
        return None;
    }

    let posted_at = legacy
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(parse_created_at);

    Some(Post {
        url: format!("https://x.com/{handle}/status/{id}"),
        id,
        handle: handle.to_string(),
        posted_at,
        media,
    })
}

fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Usable media attached to a post's legacy payload.
///
/// Photos take the direct high-quality URL. Videos and animated GIFs take
/// the highest-bitrate mp4 variant; entities without one are dropped.
pub(crate) fn extract_media(legacy: &Value) -> Vec<MediaItem> {
    let entities = legacy
        .pointer("/extended_entities/media")
        .and_then(Value::as_array);
    let Some(entities) = entities else {
        return Vec::new();
    };

    let mut media = Vec::new();
    for entity in entities {
        let kind = entity.get("type").and_then(Value::as_str);
        match kind {
            Some("photo") => {
                if let Some(url) = entity.get("media_url_https").and_then(Value::as_str) {
                    media.push(MediaItem {
                        url: format!("{url}?name=orig"),
                        media_type: MediaType::Photo,
                    });
                }
            }
            Some("video") | Some("animated_gif") => {
                let media_type = if kind == Some("animated_gif") {
                    MediaType::Gif
                } else {
                    MediaType::Video
                };
                if let Some(url) = best_mp4_variant(entity) {
                    media.push(MediaItem { url, media_type });
                }
            }
            _ => {}
        }
    }
    media
}

fn best_mp4_variant(entity: &Value) -> Option<String> {
    entity
        .pointer("/video_info/variants")
        .and_then(Value::as_array)?
        .iter()
        .filter(|v| v.get("content_type").and_then(Value::as_str) == Some("video/mp4"))
        .max_by_key(|v| v.get("bitrate").and_then(Value::as_i64).unwrap_or(0))
        .and_then(|v| v.get("url").and_then(Value::as_str))
        .map(String::from)
}

/// Page the media timeline, threading bottom cursors, and assemble the
/// deduplicated newest-first result.
pub(crate) async fn fetch_media_timeline(
    client: &GraphqlSourceClient,
    user_id: &str,
    handle: &str,
    direction: FetchDirection,
    cursor: Option<&str>,
    page_limit: u32,
) -> Result<MediaTimeline, SourceError> {
    let mut cursor: Option<String> = match direction {
        // Incremental fetches start from the timeline head.
        FetchDirection::Newer => None,
        FetchDirection::Older => cursor.map(String::from),
    };
    let mut posts: Vec<Post> = Vec::new();
    let mut final_cursor: Option<String> = None;

    for page_index in 0..page_limit {
        let mut variables = serde_json::json!({
            "userId": user_id,
            "count": PAGE_SIZE,
            "includePromotedContent": false,
            "withClientEventToken": false,
            "withBirdwatchNotes": false,
            "withVoice": true,
            "withV2Timeline": true,
        });
        if let Some(current) = cursor.as_deref() {
            variables["cursor"] = Value::String(current.to_string());
        }

        let body = client.execute(&USER_MEDIA, variables).await?;
        let page = parse_timeline_page(&body, handle);
        tracing::debug!(
            handle,
            page = page_index + 1,
            posts = page.posts.len(),
            has_cursor = page.bottom_cursor.is_some(),
            "fetched timeline page"
        );

        for post in page.posts {
            if !posts.iter().any(|existing| existing.id == post.id) {
                posts.push(post);
            }
        }

        match page.bottom_cursor {
            None => {
                final_cursor = None;
                break;
            }
            Some(bottom) => {
                let stalled = cursor.as_deref() == Some(bottom.as_str());
                final_cursor = Some(bottom.clone());
                if stalled {
                    break;
                }
                cursor = Some(bottom);
            }
        }
    }

    posts.sort_by(|a, b| b.numeric_id().cmp(&a.numeric_id()));

    Ok(MediaTimeline {
        posts,
        next_cursor: match direction {
            FetchDirection::Older => final_cursor,
            FetchDirection::Newer => None,
        },
    })
}
