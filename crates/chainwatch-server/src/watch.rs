//! The watch read path.
//!
//! Synchronous functions over a borrowed connection; the HTTP handler runs
//! them on a blocking thread and drives the long-poll hold between scans.
//! Nothing here writes to the database, so repeating a request with the
//! same cursor is always safe.

use chainwatch_db::chain;
use chainwatch_db::store::load_token;
use chainwatch_db::StoreError;
use chainwatch_types::{
    ChainNode, CursorType, Cursor, ResourceKey, WatchError, WatchEventDetail, WatchEventOptions,
    WatchResp, NO_EVENT_CURSOR,
};
use rusqlite::Connection;
use serde_json::Value;

/// Errors raised by the read path.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The request cannot be served.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The chain could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Position a held cursor watch continues scanning from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    /// Scan nodes with IDs greater than this.
    pub after_id: i64,
    /// Cursor to hand back if the hold times out.
    pub cursor: String,
}

impl Resume {
    /// The events to answer with when the hold expires.
    pub fn into_events(self, resource: CursorType) -> Vec<WatchEventDetail> {
        vec![WatchEventDetail::cursor_only(self.cursor, resource)]
    }
}

/// Result of one read attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Answer the request with these events.
    Done(Vec<WatchEventDetail>),
    /// Nothing matched yet; the caller may wait and [`rescan`].
    Pending(Resume),
}

/// Serves the first scan of a watch request against the chain of `key`.
///
/// A non-empty cursor takes precedence over `start_from`; with neither the
/// request watches from the newest node.
///
/// # Errors
///
/// Returns `ReadError::Watch` for invalid parameters, a malformed, foreign
/// or unknown cursor, or a cursor past the retention window, and
/// `ReadError::Store` when the chain cannot be read.
pub fn begin(
    conn: &Connection,
    key: &ResourceKey,
    opts: &WatchEventOptions,
    now: i64,
    batch_limit: usize,
) -> Result<Step, ReadError> {
    opts.validate()?;

    if !opts.cursor.is_empty() {
        return watch_with_cursor(conn, key, opts, now, batch_limit);
    }
    if opts.start_from != 0 {
        return watch_with_start_from(conn, key, opts, now, batch_limit).map(Step::Done);
    }
    watch_from_now(conn, key, opts, now).map(|event| Step::Done(vec![event]))
}

/// Scans again from a pending position.
///
/// # Errors
///
/// Returns `ReadError::Store` when the chain cannot be read.
pub fn rescan(
    conn: &Connection,
    key: &ResourceKey,
    opts: &WatchEventOptions,
    resume: &Resume,
    now: i64,
    batch_limit: usize,
) -> Result<Step, ReadError> {
    scan_after(
        conn,
        key,
        opts,
        resume.after_id,
        &resume.cursor,
        retained_since(key, now),
        batch_limit,
    )
}

/// Builds the response body for a finished read.
///
/// When nothing was watched the response carries a single cursor-only
/// event to resume from: the request cursor if there was one, the
/// no-event marker otherwise, or the cursor of the last node skipped by the
/// filters.
pub fn build_response(
    start_cursor: &str,
    resource: CursorType,
    events: Vec<WatchEventDetail>,
) -> WatchResp {
    let echo = if start_cursor.is_empty() {
        NO_EVENT_CURSOR
    } else {
        start_cursor
    };

    let Some(first) = events.first() else {
        return WatchResp::not_watched(echo, resource);
    };
    if first.bk_cursor == NO_EVENT_CURSOR {
        return WatchResp::not_watched(echo, resource);
    }
    if first.bk_event_type.is_none() {
        return WatchResp::not_watched(first.bk_cursor.clone(), resource);
    }
    WatchResp::watched(events)
}

fn retained_since(key: &ResourceKey, now: i64) -> i64 {
    now.saturating_sub(key.ttl_seconds())
}

fn no_event(resource: CursorType) -> WatchEventDetail {
    WatchEventDetail::cursor_only(NO_EVENT_CURSOR, resource)
}

fn watch_with_cursor(
    conn: &Connection,
    key: &ResourceKey,
    opts: &WatchEventOptions,
    now: i64,
    batch_limit: usize,
) -> Result<Step, ReadError> {
    let since = retained_since(key, now);

    if opts.cursor == NO_EVENT_CURSOR {
        return match chain::earliest_node(conn, key, since)? {
            Some(first) => scan_after(
                conn,
                key,
                opts,
                first.id - 1,
                NO_EVENT_CURSOR,
                since,
                batch_limit,
            ),
            None => Ok(Step::Pending(Resume {
                after_id: last_event_id(conn, key)?,
                cursor: NO_EVENT_CURSOR.to_string(),
            })),
        };
    }

    let cursor = Cursor::decode(&opts.cursor)?;
    if cursor.cursor_type != key.cursor_type() {
        return Err(WatchError::InvalidCursor(format!(
            "cursor belongs to {}, not {}",
            cursor.cursor_type,
            key.cursor_type()
        ))
        .into());
    }

    let Some(anchor) = chain::find_node_by_cursor(conn, key, &opts.cursor, since)? else {
        if i64::from(cursor.cluster_time.sec) < since {
            return Err(WatchError::CursorExpired(format!(
                "no {} event is retained at {}, the window starts at {}",
                key.cursor_type(),
                cursor.cluster_time.sec,
                since
            ))
            .into());
        }
        return Err(WatchError::InvalidCursor(format!(
            "no {} event carries this cursor",
            key.cursor_type()
        ))
        .into());
    };

    scan_after(conn, key, opts, anchor.id, &opts.cursor, since, batch_limit)
}

fn watch_with_start_from(
    conn: &Connection,
    key: &ResourceKey,
    opts: &WatchEventOptions,
    now: i64,
    batch_limit: usize,
) -> Result<Vec<WatchEventDetail>, ReadError> {
    let age = now - opts.start_from;
    if age < 0 || age > key.ttl_seconds() {
        return Err(WatchError::InvalidParams(format!(
            "start_from {} is outside the last {} seconds",
            opts.start_from,
            key.ttl_seconds()
        ))
        .into());
    }

    let since = retained_since(key, now);
    let Some(latest) = chain::latest_node(conn, key, since)? else {
        return Ok(vec![no_event(opts.resource)]);
    };

    if i64::from(latest.cluster_time.sec) <= opts.start_from {
        return Ok(vec![latest_as_event(&latest, opts)]);
    }

    let Some(first) = chain::first_node_after(conn, key, opts.start_from, since)? else {
        return Ok(vec![WatchEventDetail::cursor_only(latest.cursor, opts.resource)]);
    };

    match scan_after(conn, key, opts, first.id - 1, NO_EVENT_CURSOR, since, batch_limit)? {
        Step::Done(events) => Ok(events),
        Step::Pending(resume) => Ok(resume.into_events(opts.resource)),
    }
}

fn watch_from_now(
    conn: &Connection,
    key: &ResourceKey,
    opts: &WatchEventOptions,
    now: i64,
) -> Result<WatchEventDetail, ReadError> {
    match chain::latest_node(conn, key, retained_since(key, now))? {
        Some(latest) => Ok(latest_as_event(&latest, opts)),
        None => Ok(no_event(opts.resource)),
    }
}

fn latest_as_event(latest: &ChainNode, opts: &WatchEventOptions) -> WatchEventDetail {
    if matches_filters(latest, opts) {
        to_event(latest, opts)
    } else {
        no_event(opts.resource)
    }
}

/// Scans nodes after `after_id`. Matching nodes finish the read; when the
/// scan only found filtered-out nodes the position moves past them.
fn scan_after(
    conn: &Connection,
    key: &ResourceKey,
    opts: &WatchEventOptions,
    after_id: i64,
    fallback_cursor: &str,
    since: i64,
    batch_limit: usize,
) -> Result<Step, ReadError> {
    let nodes = chain::nodes_after_id(conn, key, after_id, since, batch_limit)?;
    let Some(last) = nodes.last() else {
        return Ok(Step::Pending(Resume {
            after_id,
            cursor: fallback_cursor.to_string(),
        }));
    };

    let events: Vec<WatchEventDetail> = nodes
        .iter()
        .filter(|node| matches_filters(node, opts))
        .map(|node| to_event(node, opts))
        .collect();

    if events.is_empty() {
        tracing::trace!(
            resource = %opts.resource,
            skipped = nodes.len(),
            "no scanned node matched the filters"
        );
        return Ok(Step::Pending(Resume {
            after_id: last.id,
            cursor: last.cursor.clone(),
        }));
    }
    Ok(Step::Done(events))
}

/// Position recorded in the token document, `0` when there is none.
fn last_event_id(conn: &Connection, key: &ResourceKey) -> Result<i64, StoreError> {
    let id = load_token(conn, key.collection())?
        .and_then(|doc| doc.get("id").and_then(Value::as_i64))
        .unwrap_or(0);
    Ok(id)
}

fn matches_filters(node: &ChainNode, opts: &WatchEventOptions) -> bool {
    let type_hit = opts.event_types.is_empty() || opts.event_types.contains(&node.event_type);
    let sub_resource_hit = opts.filter.sub_resource.is_empty()
        || node.sub_resource.as_deref() == Some(opts.filter.sub_resource.as_str());
    type_hit && sub_resource_hit
}

fn to_event(node: &ChainNode, opts: &WatchEventOptions) -> WatchEventDetail {
    WatchEventDetail {
        bk_cursor: node.cursor.clone(),
        bk_resource: opts.resource,
        bk_event_type: Some(node.event_type),
        bk_detail: node
            .detail
            .as_ref()
            .map(|detail| project_fields(detail, &opts.fields)),
    }
}

/// Keeps only the listed top-level keys of an object detail. An empty list
/// keeps everything.
pub fn project_fields(detail: &Value, fields: &[String]) -> Value {
    match detail {
        Value::Object(map) if !fields.is_empty() => Value::Object(
            map.iter()
                .filter(|(name, _)| fields.iter().any(|field| field == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainwatch_db::chain::{append_node, NewChainNode};
    use chainwatch_db::{bootstrap_resources, run_migrations};
    use chainwatch_types::{
        ClusterTime, EventType, ResourceRegistry, CHAIN_TTL_SECONDS,
    };
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;
    const LIMIT: usize = 200;

    fn setup() -> (Connection, ResourceRegistry) {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let registry = ResourceRegistry::builtin();
        bootstrap_resources(&conn, &registry, NOW).unwrap();
        (conn, registry)
    }

    fn append(conn: &Connection, key: &ResourceKey, oid: &str, ago: i64) -> ChainNode {
        append_node(
            conn,
            key,
            &NewChainNode::new(oid, EventType::Update, ClusterTime::new((NOW - ago) as u32, 0))
                .with_detail(json!({"oid": oid, "bk_host_name": "h"})),
        )
        .unwrap()
    }

    fn ids(events: &[WatchEventDetail], nodes: &[ChainNode]) -> Vec<i64> {
        events
            .iter()
            .map(|e| {
                nodes
                    .iter()
                    .find(|n| n.cursor == e.bk_cursor)
                    .map(|n| n.id)
                    .unwrap_or(-1)
            })
            .collect()
    }

    #[test]
    fn cursor_watch_returns_only_later_nodes() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        let nodes: Vec<_> = (0..44)
            .map(|i| append(&conn, host, &format!("h{i}"), 100 - i))
            .collect();

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.cursor = nodes[40].cursor.clone();
        let Step::Done(events) = begin(&conn, host, &opts, NOW, LIMIT).unwrap() else {
            panic!("expected events");
        };
        assert_eq!(ids(&events, &nodes), vec![42, 43, 44]);

        opts.cursor = events.last().unwrap().bk_cursor.clone();
        let step = begin(&conn, host, &opts, NOW, LIMIT).unwrap();
        assert_eq!(
            step,
            Step::Pending(Resume {
                after_id: 44,
                cursor: opts.cursor.clone()
            })
        );

        let n45 = append(&conn, host, "h44", 1);
        let Step::Pending(resume) = step else { unreachable!() };
        let Step::Done(events) = rescan(&conn, host, &opts, &resume, NOW, LIMIT).unwrap() else {
            panic!("expected the new node");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bk_cursor, n45.cursor);
    }

    #[test]
    fn expired_cursor_is_reported_distinctly() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        let stale = append(&conn, host, "old", CHAIN_TTL_SECONDS + 3_600);
        append(&conn, host, "new", 10);

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.cursor = stale.cursor;
        let err = begin(&conn, host, &opts, NOW, LIMIT).unwrap_err();
        assert!(
            matches!(err, ReadError::Watch(WatchError::CursorExpired(_))),
            "{err:?}"
        );
    }

    #[test]
    fn expired_cursor_after_purge_is_still_expired() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        let cursor = Cursor::new(
            CursorType::Host,
            "gone",
            ClusterTime::new((NOW - CHAIN_TTL_SECONDS - 1) as u32, 0),
        );

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.cursor = cursor.encode();
        let err = begin(&conn, host, &opts, NOW, LIMIT).unwrap_err();
        assert!(matches!(err, ReadError::Watch(WatchError::CursorExpired(_))));
    }

    #[test]
    fn unknown_recent_cursor_is_invalid() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        let cursor = Cursor::new(CursorType::Host, "never", ClusterTime::new(NOW as u32, 0));

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.cursor = cursor.encode();
        let err = begin(&conn, host, &opts, NOW, LIMIT).unwrap_err();
        assert!(matches!(err, ReadError::Watch(WatchError::InvalidCursor(_))));
    }

    #[test]
    fn foreign_and_garbage_cursors_are_invalid() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        let set = registry.key_for(CursorType::Set).unwrap();
        let set_node = append(&conn, set, "s1", 5);

        for cursor in [set_node.cursor, "garbage!".to_string()] {
            let mut opts = WatchEventOptions::new(CursorType::Host);
            opts.cursor = cursor;
            let err = begin(&conn, host, &opts, NOW, LIMIT).unwrap_err();
            assert!(matches!(err, ReadError::Watch(WatchError::InvalidCursor(_))));
        }
    }

    #[test]
    fn no_event_cursor_starts_at_the_earliest_node() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.cursor = NO_EVENT_CURSOR.to_string();
        let step = begin(&conn, host, &opts, NOW, LIMIT).unwrap();
        assert_eq!(
            step,
            Step::Pending(Resume {
                after_id: 0,
                cursor: NO_EVENT_CURSOR.to_string()
            })
        );

        let first = append(&conn, host, "h1", 3);
        let Step::Done(events) = begin(&conn, host, &opts, NOW, LIMIT).unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events[0].bk_cursor, first.cursor);
    }

    #[test]
    fn start_from_must_be_within_the_window() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();

        for start_from in [NOW + 60, NOW - CHAIN_TTL_SECONDS - 1, -10] {
            let mut opts = WatchEventOptions::new(CursorType::Host);
            opts.start_from = start_from;
            let err = begin(&conn, host, &opts, NOW, LIMIT).unwrap_err();
            assert!(
                matches!(err, ReadError::Watch(WatchError::InvalidParams(_))),
                "{start_from}: {err:?}"
            );
        }
    }

    #[test]
    fn start_from_on_empty_chain_is_not_watched() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.start_from = NOW - 60;
        let Step::Done(events) = begin(&conn, host, &opts, NOW, LIMIT).unwrap() else {
            panic!("start_from never holds");
        };
        let resp = build_response("", CursorType::Host, events);
        assert!(!resp.bk_watched);
        assert_eq!(resp.bk_events[0].bk_cursor, NO_EVENT_CURSOR);
    }

    #[test]
    fn start_from_includes_the_first_later_node() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        append(&conn, host, "before", 120);
        let after = append(&conn, host, "after", 30);
        let last = append(&conn, host, "last", 10);

        let mut opts = WatchEventOptions::new(CursorType::Host);
        opts.start_from = NOW - 60;
        let Step::Done(events) = begin(&conn, host, &opts, NOW, LIMIT).unwrap() else {
            panic!("expected events");
        };
        let cursors: Vec<_> = events.iter().map(|e| e.bk_cursor.clone()).collect();
        assert_eq!(cursors, vec![after.cursor, last.cursor]);
    }

    #[test]
    fn from_now_returns_the_latest_matching_node() {
        let (conn, registry) = setup();
        let host = registry.key_for(CursorType::Host).unwrap();
        append(&conn, host, "a", 20);
        let latest = append(&conn, host, "b", 10);

        let opts = WatchEventOptions::new(CursorType::Host);
        let Step::Done(events) = begin(&conn, host, &opts, NOW, LIMIT).unwrap() else {
            panic!("from now never holds");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bk_cursor, latest.cursor);

        let mut deletes_only = WatchEventOptions::new(CursorType::Host);
        deletes_only.event_types = vec![EventType::Delete];
        let Step::Done(events) = begin(&conn, host, &deletes_only, NOW, LIMIT).unwrap() else {
            panic!("from now never holds");
        };
        assert_eq!(events[0].bk_cursor, NO_EVENT_CURSOR);
    }

    #[test]
    fn filtered_out_nodes_advance_the_position() {
        let (conn, registry) = setup();
        let inst = registry.key_for(CursorType::ObjectInstance).unwrap();
        let anchor = append_node(
            &conn,
            inst,
            &NewChainNode::new("i0", EventType::Create, ClusterTime::new((NOW - 50) as u32, 0))
                .with_sub_resource("bk_switch"),
        )
        .unwrap();
        let skipped = append_node(
            &conn,
            inst,
            &NewChainNode::new("i1", EventType::Create, ClusterTime::new((NOW - 40) as u32, 0))
                .with_sub_resource("bk_router"),
        )
        .unwrap();

        let mut opts = WatchEventOptions::new(CursorType::ObjectInstance);
        opts.cursor = anchor.cursor;
        opts.filter.sub_resource = "bk_switch".to_string();
        let step = begin(&conn, inst, &opts, NOW, LIMIT).unwrap();
        let Step::Pending(resume) = step else {
            panic!("nothing should match");
        };
        assert_eq!(resume.after_id, skipped.id);

        let resp = build_response(&opts.cursor, opts.resource, resume.into_events(opts.resource));
        assert!(!resp.bk_watched);
        assert_eq!(resp.bk_events[0].bk_cursor, skipped.cursor);
    }

    #[test]
    fn build_response_rules() {
        let marker = WatchEventDetail::cursor_only(NO_EVENT_CURSOR, CursorType::Host);
        let resp = build_response("start", CursorType::Host, vec![marker.clone()]);
        assert!(!resp.bk_watched);
        assert_eq!(resp.bk_events[0].bk_cursor, "start");

        let resp = build_response("", CursorType::Host, vec![marker]);
        assert_eq!(resp.bk_events[0].bk_cursor, NO_EVENT_CURSOR);

        let resp = build_response("start", CursorType::Host, Vec::new());
        assert_eq!(resp.bk_events[0].bk_cursor, "start");

        let event = WatchEventDetail {
            bk_cursor: "c".to_string(),
            bk_resource: CursorType::Host,
            bk_event_type: Some(EventType::Create),
            bk_detail: None,
        };
        let resp = build_response("", CursorType::Host, vec![event.clone()]);
        assert!(resp.bk_watched);
        assert_eq!(resp.bk_events, vec![event]);
    }

    #[test]
    fn projection_keeps_listed_fields() {
        let detail = json!({"bk_host_id": 1, "bk_host_name": "a", "bk_os_type": "1"});
        let fields = vec!["bk_host_id".to_string(), "bk_os_type".to_string()];
        assert_eq!(
            project_fields(&detail, &fields),
            json!({"bk_host_id": 1, "bk_os_type": "1"})
        );
        assert_eq!(project_fields(&detail, &[]), detail);
        assert_eq!(project_fields(&json!(5), &fields), json!(5));
    }
}
