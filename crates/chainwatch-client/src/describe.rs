//! Human-readable rendering of a resume cursor.

use chainwatch_types::{Cursor, WatchError};
use chrono::{DateTime, SecondsFormat, Utc};

/// Decodes `encoded` and renders it one field per line:
///
/// ```text
/// type: host
/// oid: 5f3a1c2b9d8e7f6a5b4c3d2e
/// rawClusterTime: {sec: 1609459200, nano: 0}
/// clusterTime: 2021-01-01T00:00:00Z
/// ```
///
/// # Errors
///
/// Returns `WatchError::InvalidCursor` when the cursor cannot be decoded.
pub fn describe_cursor(encoded: &str) -> Result<String, WatchError> {
    let cursor = Cursor::decode(encoded.trim())?;
    let time = cursor.cluster_time;
    let readable = DateTime::<Utc>::from_timestamp(i64::from(time.sec), 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();

    Ok(format!(
        "type: {}\noid: {}\nrawClusterTime: {{sec: {}, nano: {}}}\nclusterTime: {}",
        cursor.cursor_type, cursor.oid, time.sec, time.nano, readable
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainwatch_types::{ClusterTime, CursorType, NO_EVENT_CURSOR};

    #[test]
    fn host_cursor_is_rendered_field_by_field() {
        let encoded = Cursor::new(
            CursorType::Host,
            "5f3a1c2b9d8e7f6a5b4c3d2e",
            ClusterTime::new(1_609_459_200, 0),
        )
        .encode();

        let text = describe_cursor(&encoded).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "type: host",
                "oid: 5f3a1c2b9d8e7f6a5b4c3d2e",
                "rawClusterTime: {sec: 1609459200, nano: 0}",
                "clusterTime: 2021-01-01T00:00:00Z",
            ]
        );
    }

    #[test]
    fn undecodable_input_is_an_invalid_cursor() {
        assert!(matches!(
            describe_cursor("%%%"),
            Err(WatchError::InvalidCursor(_))
        ));
        assert!(matches!(
            describe_cursor(NO_EVENT_CURSOR),
            Err(WatchError::InvalidCursor(_))
        ));
    }
}
