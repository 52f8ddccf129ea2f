use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use regex::Regex;
use tracing::debug;
use warden_proto::proto::{PlayerId, PlayerRecord};

use crate::config::PlayerPatterns;
use crate::util::now_millis;

/// Online players derived from server output. Keys are lowercased ids.
#[derive(Clone)]
pub struct PlayerTracker {
    join: Regex,
    leave: Regex,
    online: Arc<Mutex<BTreeMap<String, Session>>>,
}

#[derive(Debug, Clone)]
struct Session {
    id: PlayerId,
    joined_at_ms: u64,
}

impl PlayerTracker {
    pub fn new(patterns: &PlayerPatterns) -> Result<Self, regex::Error> {
        Ok(Self {
            join: Regex::new(&patterns.join)?,
            leave: Regex::new(&patterns.leave)?,
            online: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    fn online(&self) -> MutexGuard<'_, BTreeMap<String, Session>> {
        self.online.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe(&self, line: &str) {
        if let Some(player) = capture(&self.join, line) {
            debug!("player joined: {player}");
            self.online().entry(player.to_lowercase()).or_insert(Session {
                id: player,
                joined_at_ms: now_millis(),
            });
        } else if let Some(player) = capture(&self.leave, line) {
            debug!("player left: {player}");
            self.online().remove(&player.to_lowercase());
        }
    }

    pub fn is_online(&self, player: &str) -> bool {
        self.online().contains_key(&player.to_lowercase())
    }

    pub fn clear(&self) {
        self.online().clear();
    }

    /// Records ordered by join time, with session length measured at `now_ms`.
    pub fn list(&self, now_ms: u64) -> Vec<PlayerRecord> {
        let mut records: Vec<PlayerRecord> = self
            .online()
            .values()
            .map(|session| PlayerRecord {
                id: session.id.clone(),
                joined_at_ms: session.joined_at_ms,
                session_ms: now_ms.saturating_sub(session.joined_at_ms),
            })
            .collect();
        records.sort_by(|a, b| a.joined_at_ms.cmp(&b.joined_at_ms).then_with(|| a.id.cmp(&b.id)));
        records
    }
}

fn capture(re: &Regex, line: &str) -> Option<String> {
    re.captures(line)
        .and_then(|caps| caps.name("player"))
        .map(|m| m.as_str().to_string())
}
