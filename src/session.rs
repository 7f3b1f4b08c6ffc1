use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Placeholder for any participant or call field we never learned.
pub const UNKNOWN: &str = "unknown";

/// Prefix of locally generated stream identifiers.
pub const GENERATED_STREAM_PREFIX: &str = "st_";

const MAX_IDENTIFIER_LEN: usize = 128;

/// Provider account details carried on the call-started notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountMeta {
    pub account_id: String,
    pub call_app_id: String,
}

/// What we know about a call before its media socket connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub account: AccountMeta,
    /// Filled in by the stream-started notification.
    pub stream_id: Option<String>,
}

impl Default for CorrelationRecord {
    fn default() -> Self {
        Self {
            call_id: UNKNOWN.to_string(),
            from_number: UNKNOWN.to_string(),
            to_number: UNKNOWN.to_string(),
            account: AccountMeta::default(),
            stream_id: None,
        }
    }
}

/// The three notification events the store understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    CallStarted {
        call_id: String,
        from: String,
        to: String,
        account: AccountMeta,
    },
    StreamStarted {
        call_id: String,
        stream_id: String,
    },
    CallCompleted {
        call_id: String,
    },
}

struct Slot {
    record: CorrelationRecord,
    /// Fired when the call completes, ending any relay still retrying.
    cancel: CancellationToken,
}

/// Correlation records of live calls, keyed by call id.
///
/// Written by the notification receiver and read once by each relay when
/// its media socket connects. Every operation locks only the shard holding
/// its key, so unrelated calls never wait on each other.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<String, Slot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh record for `call_id`. A repeated start replaces the
    /// record but keeps the existing cancellation token.
    pub fn record_call_start(&self, call_id: &str, from: &str, to: &str, account: AccountMeta) {
        let record = CorrelationRecord {
            call_id: call_id.to_string(),
            from_number: normalize_number(from),
            to_number: normalize_number(to),
            account,
            stream_id: None,
        };

        match self.inner.entry(call_id.to_string()) {
            Entry::Occupied(mut slot) => {
                tracing::info!(call_id, "Duplicate call start, replacing record");
                slot.get_mut().record = record;
            }
            Entry::Vacant(slot) => {
                tracing::info!(
                    call_id,
                    from = %record.from_number,
                    to = %record.to_number,
                    account_id = %record.account.account_id,
                    call_app_id = %record.account.call_app_id,
                    "Stored call data"
                );
                slot.insert(Slot {
                    record,
                    cancel: CancellationToken::new(),
                });
            }
        }
    }

    /// Attach a stream id to a known call. Returns whether a record was updated.
    pub fn record_stream_start(&self, call_id: &str, stream_id: &str) -> bool {
        if stream_id.is_empty() {
            tracing::warn!(call_id, "Stream start without stream_id, ignoring");
            return false;
        }

        match self.inner.get_mut(call_id) {
            Some(mut slot) => {
                slot.record.stream_id = Some(stream_id.to_string());
                tracing::debug!(call_id, stream_id, "Updated call data with stream_id");
                true
            }
            None => {
                tracing::warn!(call_id, stream_id, "Stream start for unknown call, ignoring");
                false
            }
        }
    }

    /// Drop the record for a finished call and cancel anything waiting on it.
    pub fn record_call_end(&self, call_id: &str) {
        if let Some((_, slot)) = self.inner.remove(call_id) {
            slot.cancel.cancel();
            tracing::info!(call_id, "Cleaned up call data");
        }
    }

    /// Snapshot of the record for `call_id`, or an all-unknown record.
    pub fn lookup(&self, call_id: &str) -> CorrelationRecord {
        self.inner
            .get(call_id)
            .map(|slot| slot.record.clone())
            .unwrap_or_default()
    }

    /// Token that fires once `call_id` completes. Detached for unknown calls.
    pub fn cancellation(&self, call_id: &str) -> CancellationToken {
        self.inner
            .get(call_id)
            .map(|slot| slot.cancel.child_token())
            .unwrap_or_default()
    }

    pub fn apply(&self, notification: Notification) {
        match notification {
            Notification::CallStarted {
                call_id,
                from,
                to,
                account,
            } => self.record_call_start(&call_id, &from, &to, account),
            Notification::StreamStarted { call_id, stream_id } => {
                self.record_stream_start(&call_id, &stream_id);
            }
            Notification::CallCompleted { call_id } => self.record_call_end(&call_id),
        }
    }
}

/// Identity of one call as seen by its relay. Fixed once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: String,
    pub stream_id: String,
    pub from_number: String,
    pub to_number: String,
}

impl CallSession {
    /// Build the session for a newly connected media socket.
    ///
    /// `identifier` is the call id handed to us on the socket. If it is
    /// missing or malformed the store is not consulted at all. A stream id
    /// recorded by notification is used verbatim; otherwise a fresh one is
    /// generated so the call can proceed.
    pub fn resolve(identifier: Option<&str>, store: &SessionStore) -> Self {
        let call_id = match identifier {
            Some(id) if is_valid_identifier(id) => Some(id),
            Some(id) => {
                tracing::warn!(identifier = %id.escape_debug(), "Malformed call identifier, using defaults");
                None
            }
            None => None,
        };

        // Unknown calls still keep the id they connected with.
        let record = match call_id {
            Some(id) => CorrelationRecord {
                call_id: id.to_string(),
                ..store.lookup(id)
            },
            None => CorrelationRecord::default(),
        };
        let stream_id = match record.stream_id {
            Some(sid) => sid,
            None => {
                let sid = generate_stream_id();
                tracing::debug!(stream_id = %sid, "No stream id on record, generated one");
                sid
            }
        };

        Self {
            call_id: record.call_id,
            stream_id,
            from_number: record.from_number,
            to_number: record.to_number,
        }
    }
}

/// Strip `+` from a phone number, falling back to [`UNKNOWN`] when empty.
pub fn normalize_number(raw: &str) -> String {
    let number = raw.trim().replace('+', "");
    if number.is_empty() {
        UNKNOWN.to_string()
    } else {
        number
    }
}

/// 1-128 bytes of ASCII alphanumerics or `-_.:`.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// `st_` followed by 32 lowercase hex digits.
pub fn generate_stream_id() -> String {
    format!("{GENERATED_STREAM_PREFIX}{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_generated(sid: &str) -> bool {
        sid.strip_prefix(GENERATED_STREAM_PREFIX).is_some_and(|hex| {
            hex.len() == 32 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        })
    }

    #[test]
    fn call_start_normalizes_numbers() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());

        let record = store.lookup("c1");
        assert_eq!(record.call_id, "c1");
        assert_eq!(record.from_number, "1555");
        assert_eq!(record.to_number, "1666");
        assert_eq!(record.stream_id, None);
    }

    #[test]
    fn missing_numbers_become_unknown() {
        let store = SessionStore::new();
        store.record_call_start("c1", "", "+", AccountMeta::default());

        let record = store.lookup("c1");
        assert_eq!(record.from_number, UNKNOWN);
        assert_eq!(record.to_number, UNKNOWN);
    }

    #[test]
    fn stream_start_fills_stream_id() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        assert!(store.record_stream_start("c1", "s-42"));
        assert_eq!(store.lookup("c1").stream_id.as_deref(), Some("s-42"));
    }

    #[test]
    fn stream_start_for_unknown_call_is_ignored() {
        let store = SessionStore::new();
        assert!(!store.record_stream_start("ghost", "s-1"));
        assert_eq!(store.inner.len(), 0);
        assert_eq!(store.lookup("ghost"), CorrelationRecord::default());
    }

    #[test]
    fn duplicate_start_overwrites() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        store.record_stream_start("c1", "s-1");
        store.record_call_start(
            "c1",
            "+1777",
            "+1888",
            AccountMeta {
                account_id: "acct".into(),
                call_app_id: "app".into(),
            },
        );

        let record = store.lookup("c1");
        assert_eq!(store.inner.len(), 1);
        assert_eq!(record.from_number, "1777");
        assert_eq!(record.account.account_id, "acct");
        assert_eq!(record.stream_id, None);
    }

    #[test]
    fn call_end_removes_and_cancels() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        let token = store.cancellation("c1");
        assert!(!token.is_cancelled());

        store.record_call_end("c1");
        assert!(token.is_cancelled());
        assert_eq!(store.inner.len(), 0);

        // second end is a no-op
        store.record_call_end("c1");
    }

    #[test]
    fn duplicate_start_keeps_cancellation() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        let token = store.cancellation("c1");
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        store.record_call_end("c1");
        assert!(token.is_cancelled());
    }

    #[test]
    fn unknown_call_gets_detached_token() {
        let store = SessionStore::new();
        let token = store.cancellation("nobody");
        store.record_call_end("nobody");
        assert!(!token.is_cancelled());
    }

    #[test]
    fn apply_routes_notifications() {
        let store = SessionStore::new();
        store.apply(Notification::CallStarted {
            call_id: "c1".into(),
            from: "+1".into(),
            to: "+2".into(),
            account: AccountMeta::default(),
        });
        store.apply(Notification::StreamStarted {
            call_id: "c1".into(),
            stream_id: "s1".into(),
        });
        assert_eq!(store.lookup("c1").stream_id.as_deref(), Some("s1"));

        store.apply(Notification::CallCompleted {
            call_id: "c1".into(),
        });
        assert_eq!(store.inner.len(), 0);
    }

    #[test]
    fn resolve_uses_recorded_stream_id_verbatim() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        store.record_stream_start("c1", "MZ-provider-stream");

        let session = CallSession::resolve(Some("c1"), &store);
        assert_eq!(session.call_id, "c1");
        assert_eq!(session.stream_id, "MZ-provider-stream");
        assert_eq!(session.from_number, "1555");
        assert_eq!(session.to_number, "1666");
    }

    #[test]
    fn resolve_generates_stream_id_when_unresolved() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());
        store.record_call_start("c2", "+1555", "+1777", AccountMeta::default());

        let first = CallSession::resolve(Some("c1"), &store);
        let second = CallSession::resolve(Some("c2"), &store);

        assert!(is_generated(&first.stream_id), "{}", first.stream_id);
        assert!(is_generated(&second.stream_id), "{}", second.stream_id);
        assert_ne!(first.stream_id, second.stream_id);
        assert_eq!(first.from_number, "1555");
    }

    #[test]
    fn resolve_without_identifier_defaults_everything() {
        let store = SessionStore::new();
        let session = CallSession::resolve(None, &store);
        assert_eq!(session.call_id, UNKNOWN);
        assert_eq!(session.from_number, UNKNOWN);
        assert!(is_generated(&session.stream_id));
    }

    #[test]
    fn malformed_identifier_skips_lookup() {
        let store = SessionStore::new();
        store.record_call_start("c1", "+1555", "+1666", AccountMeta::default());

        for bad in ["", "c1 OR 1=1", "c1\n", &"x".repeat(200)] {
            let session = CallSession::resolve(Some(bad), &store);
            assert_eq!(session.call_id, UNKNOWN);
            assert_eq!(session.from_number, UNKNOWN);
            assert!(is_generated(&session.stream_id));
        }
    }

    #[test]
    fn concurrent_calls_do_not_share_records() {
        let store = SessionStore::new();
        std::thread::scope(|s| {
            for i in 0..8 {
                let store = store.clone();
                s.spawn(move || {
                    let id = format!("c{i}");
                    store.record_call_start(&id, &format!("+{i}"), "+0", AccountMeta::default());
                    store.record_stream_start(&id, &format!("s{i}"));
                });
            }
        });

        assert_eq!(store.inner.len(), 8);
        for i in 0..8 {
            let record = store.lookup(&format!("c{i}"));
            assert_eq!(record.from_number, i.to_string());
            assert_eq!(record.stream_id, Some(format!("s{i}")));
        }
    }
}
