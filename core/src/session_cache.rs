// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Per-session memory of "allow for this session" decisions.
//!
//! Each session gets its own bounded TTL map; nothing is ever shared across
//! sessions. Keys join the tool name with the whitelisted input fields using
//! NUL, a byte that cannot occur in a tool name or a path component. A
//! printable separator would let `("Read", "/a/b:c")` collide with a
//! differently split pair, so the separator choice is part of the contract.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use toolgate_protocol::InputMap;
use toolgate_protocol::UserDecision;
use tracing::debug;

const KEY_SEPARATOR: char = '\0';

/// Tools whose cache key is `(toolName, file_path)`.
const PATH_KEYED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookRead",
    "NotebookEdit",
];

/// Tools whose cache key is `(toolName, url)`.
const URL_KEYED_TOOLS: &[&str] = &["WebFetch"];

/// Shell execution is never memoized, whatever the user asked for.
const UNCACHEABLE_TOOLS: &[&str] = &["Bash"];

struct CacheEntry {
    decision: UserDecision,
    stored_at: Instant,
}

#[derive(Default)]
struct SessionEntries {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, as an eviction proxy for LRU.
    order: VecDeque<String>,
}

pub struct SessionPermissionCache {
    max_per_session: usize,
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntries>>,
}

impl SessionPermissionCache {
    pub fn new(max_per_session: usize, ttl: Duration) -> Self {
        Self {
            max_per_session,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Cached decision for this exact `(session, tool, input)` shape, if any.
    /// Expired entries are deleted lazily here rather than swept.
    pub fn lookup(
        &self,
        session_id: &str,
        tool_name: &str,
        input: &InputMap,
    ) -> Option<UserDecision> {
        let key = cache_key(tool_name, input)?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(session_id)?;
        let entry = session.entries.get(&key)?;
        if entry.stored_at.elapsed() > self.ttl {
            session.entries.remove(&key);
            session.order.retain(|k| k != &key);
            return None;
        }
        Some(entry.decision)
    }

    /// Remember an allow-for-session decision. Decisions that do not cache
    /// (plain allow, deny) and tools that must not be memoized are dropped
    /// on the floor.
    pub fn store(
        &self,
        session_id: &str,
        tool_name: &str,
        input: &InputMap,
        decision: UserDecision,
    ) {
        if !decision.caches_for_session() {
            return;
        }
        let Some(key) = cache_key(tool_name, input) else {
            debug!(tool_name, "refusing to cache decision for this tool");
            return;
        };

        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.entry(session_id.to_string()).or_default();
        let replaced = session
            .entries
            .insert(
                key.clone(),
                CacheEntry {
                    decision,
                    stored_at: Instant::now(),
                },
            )
            .is_some();
        if !replaced {
            session.order.push_back(key);
        }
        while session.entries.len() > self.max_per_session {
            let Some(oldest) = session.order.pop_front() else {
                break;
            };
            session.entries.remove(&oldest);
        }
    }

    pub fn drop_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    #[cfg(test)]
    fn session_len(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map_or(0, |s| s.entries.len())
    }
}

/// Build the cache key for a tool invocation, or `None` when the invocation
/// must never be cached.
fn cache_key(tool_name: &str, input: &InputMap) -> Option<String> {
    if UNCACHEABLE_TOOLS.contains(&tool_name) {
        return None;
    }

    let discriminant = if PATH_KEYED_TOOLS.contains(&tool_name) {
        string_field(input, "file_path")
    } else if URL_KEYED_TOOLS.contains(&tool_name) {
        string_field(input, "url")
    } else {
        // serde_json maps are sorted by key, so this rendering is canonical.
        serde_json::to_string(input).ok()?
    };

    Some(format!("{tool_name}{KEY_SEPARATOR}{discriminant}"))
}

fn string_field(input: &InputMap, field: &str) -> String {
    match input.get(field) {
        Some(Value::String(value)) => value.clone(),
        _ => String::new(),
    }
}
