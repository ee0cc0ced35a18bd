//! Key-space scheme
//!
//! Pure functions mapping entity identity onto primary keys and secondary
//! index keys. Prefixes are single characters to keep key strings short:
//!
//! ```text
//! i:<category>:<key>              info item
//! c:<category>                    category membership set
//! s:<sessionId>                   session
//! sessions:index                  set of all session ids
//! s:<sessionId>:m:<messageId>     message
//! s:<sessionId>:ms                ordered message id list (newest first)
//! s:<sessionId>:ms:index          unordered message id set
//! ```
//!
//! Categories, session ids and message ids may not contain `:`; info keys
//! may, since they are always the final segment.

use crate::error::{StorageError, StorageResult};

pub const INFO: &str = "i";
pub const SESSION: &str = "s";
pub const MESSAGE: &str = "m";
pub const CATEGORY: &str = "c";

/// Global set enumerating every session id
pub const SESSION_INDEX: &str = "sessions:index";

pub const CACHE_RECENT_MESSAGES: &str = "cache:recent:messages";
pub const CACHE_ACTIVE_SESSIONS: &str = "cache:active:sessions";
pub const CACHE_BUSINESS_INFO: &str = "cache:business:info";

pub fn info_key(category: &str, key: &str) -> String {
    format!("{}:{}:{}", INFO, category, key)
}

pub fn category_key(category: &str) -> String {
    format!("{}:{}", CATEGORY, category)
}

pub fn session_key(session_id: &str) -> String {
    format!("{}:{}", SESSION, session_id)
}

pub fn message_key(session_id: &str, message_id: &str) -> String {
    format!("{}:{}:{}:{}", SESSION, session_id, MESSAGE, message_id)
}

pub fn session_messages_key(session_id: &str) -> String {
    format!("{}:{}:{}s", SESSION, session_id, MESSAGE)
}

pub fn session_messages_index_key(session_id: &str) -> String {
    format!("{}:{}:{}s:index", SESSION, session_id, MESSAGE)
}

/// Split an info primary key back into `(category, key)`
pub fn parse_info_key(full_key: &str) -> Option<(&str, &str)> {
    let rest = full_key.strip_prefix(INFO)?.strip_prefix(':')?;
    let (category, key) = rest.split_once(':')?;
    if category.is_empty() {
        return None;
    }
    Some((category, key))
}

/// Extract the session id from a session primary key
///
/// Returns `None` for the per-session message keys and indexes that share
/// the `s:` prefix.
pub fn parse_session_key(full_key: &str) -> Option<&str> {
    let id = full_key.strip_prefix(SESSION)?.strip_prefix(':')?;
    if id.is_empty() || id.contains(':') {
        return None;
    }
    Some(id)
}

/// Split a message primary key into `(session_id, message_id)`
pub fn parse_message_key(full_key: &str) -> Option<(&str, &str)> {
    let rest = full_key.strip_prefix(SESSION)?.strip_prefix(':')?;
    let (session_id, rest) = rest.split_once(':')?;
    let message_id = rest.strip_prefix(MESSAGE)?.strip_prefix(':')?;
    if session_id.is_empty() || message_id.is_empty() || message_id.contains(':') {
        return None;
    }
    Some((session_id, message_id))
}

/// Reject identifiers that would collide with the key separator
pub fn validate_segment(kind: &str, value: &str) -> StorageResult<()> {
    if value.is_empty() {
        return Err(StorageError::InvalidInput(format!("{} must not be empty", kind)));
    }
    if value.contains(':') {
        return Err(StorageError::InvalidInput(format!(
            "{} '{}' must not contain ':'",
            kind, value
        )));
    }
    Ok(())
}

/// Escape glob metacharacters so user text matches literally inside a pattern
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

pub fn info_cache_key(category: &str, key: &str) -> String {
    format!("{}:{}:{}", CACHE_BUSINESS_INFO, category, key)
}

/// Substring covering every cached info read in a category
pub fn info_cache_scope(category: &str) -> String {
    format!("{}:{}:", CACHE_BUSINESS_INFO, category)
}

pub fn session_cache_key(session_id: &str) -> String {
    format!("{}:{}", CACHE_ACTIVE_SESSIONS, session_id)
}

/// Substring covering every cached message read in a session
pub fn messages_cache_scope(session_id: &str) -> String {
    format!("{}:{}:", CACHE_RECENT_MESSAGES, session_id)
}

pub fn message_cache_key(session_id: &str, message_id: &str) -> String {
    format!("{}{}", messages_cache_scope(session_id), message_id)
}

pub fn page_cache_key(session_id: &str, limit: usize, offset: usize) -> String {
    format!("{}page:{}:{}", messages_cache_scope(session_id), limit, offset)
}

pub fn recent_cache_key(session_id: &str, hours: u32) -> String {
    format!("{}recent:{}h", messages_cache_scope(session_id), hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(info_key("docs", "a"), "i:docs:a");
        assert_eq!(category_key("docs"), "c:docs");
        assert_eq!(session_key("abc"), "s:abc");
        assert_eq!(message_key("abc", "msg_1"), "s:abc:m:msg_1");
        assert_eq!(session_messages_key("abc"), "s:abc:ms");
        assert_eq!(session_messages_index_key("abc"), "s:abc:ms:index");
    }

    #[test]
    fn test_parse_session_key_skips_message_structures() {
        assert_eq!(parse_session_key("s:abc"), Some("abc"));
        assert_eq!(parse_session_key("s:abc:ms"), None);
        assert_eq!(parse_session_key("s:abc:ms:index"), None);
        assert_eq!(parse_session_key("s:abc:m:msg_1"), None);
        assert_eq!(parse_session_key("sessions:index"), None);
        assert_eq!(parse_session_key("i:docs:a"), None);
    }

    #[test]
    fn test_parse_message_key() {
        assert_eq!(parse_message_key("s:abc:m:msg_1"), Some(("abc", "msg_1")));
        assert_eq!(parse_message_key("s:abc:ms"), None);
        assert_eq!(parse_message_key("s:abc"), None);
    }

    #[test]
    fn test_info_key_with_colon_in_key() {
        let full = info_key("docs", "v1:intro");
        assert_eq!(parse_info_key(&full), Some(("docs", "v1:intro")));
    }

    #[test]
    fn test_validate_segment() {
        assert!(validate_segment("category", "docs").is_ok());
        assert!(matches!(
            validate_segment("category", "a:b"),
            Err(StorageError::InvalidInput(_))
        ));
        assert!(validate_segment("session id", "").is_err());
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("plain"), "plain");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_cache_scopes_do_not_overlap_prefixed_ids() {
        let scope = messages_cache_scope("s1");
        assert!(message_cache_key("s1", "m").contains(&scope));
        assert!(!message_cache_key("s10", "m").contains(&scope));
        assert!(page_cache_key("s1", 50, 0).contains(&scope));
        assert!(recent_cache_key("s1", 24).contains(&scope));
    }

    proptest! {
        #[test]
        fn info_key_round_trip(category in "[^:]{1,24}", key in ".{0,48}") {
            let full = info_key(&category, &key);
            let (c, k) = parse_info_key(&full).unwrap();
            prop_assert_eq!(c, category.as_str());
            prop_assert_eq!(k, key.as_str());
        }

        #[test]
        fn message_key_round_trip(session in "[a-z0-9_-]{1,16}", message in "[a-z0-9_]{1,16}") {
            let full = message_key(&session, &message);
            prop_assert_eq!(parse_message_key(&full), Some((session.as_str(), message.as_str())));
        }
    }
}
