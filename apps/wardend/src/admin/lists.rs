use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::info;
use warden_proto::proto::{ModerationList, ModerationSnapshot, PlayerId};

use crate::config::ManagerConfig;
use crate::errors::AdminError;
use crate::util::write_atomic;

const MAX_PLAYER_ID_LEN: usize = 32;

/// Trim and check an identifier: 1-32 chars of `[A-Za-z0-9_.-]`.
pub fn validate_player_id(raw: &str) -> Result<PlayerId, AdminError> {
    let id = raw.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_PLAYER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(id.to_string())
    } else {
        Err(AdminError::InvalidPlayerIdentifier(raw.to_string()))
    }
}

/// The server's whitelist, ban and operator files. Entries are JSON objects owned by
/// the server; only the key field is interpreted and other fields are kept as they are.
#[derive(Debug, Clone)]
pub struct ModerationStore {
    whitelist: PathBuf,
    banned: PathBuf,
    operators: PathBuf,
    key_field: String,
}

impl ModerationStore {
    pub fn new(whitelist: PathBuf, banned: PathBuf, operators: PathBuf, key_field: String) -> Self {
        Self {
            whitelist,
            banned,
            operators,
            key_field,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        let m = &config.moderation;
        Self::new(
            config.data_path(&m.whitelist_file),
            config.data_path(&m.banned_file),
            config.data_path(&m.operators_file),
            m.key_field.clone(),
        )
    }

    pub fn path(&self, list: ModerationList) -> &Path {
        match list {
            ModerationList::Whitelist => &self.whitelist,
            ModerationList::Banned => &self.banned,
            ModerationList::Operators => &self.operators,
        }
    }

    fn read(&self, list: ModerationList) -> Result<Vec<Value>, AdminError> {
        let path = self.path(list);
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AdminError::io(format!("reading {}", path.display()), err)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<Vec<Value>>(&content).map_err(|err| {
            AdminError::io(
                format!("parsing {}", path.display()),
                io::Error::new(io::ErrorKind::InvalidData, err),
            )
        })
    }

    fn write(&self, list: ModerationList, entries: &[Value]) -> Result<(), AdminError> {
        let path = self.path(list);
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|err| AdminError::io("encoding moderation list", io::Error::other(err)))?;
        write_atomic(path, &json).map_err(|err| AdminError::io(format!("writing {}", path.display()), err))
    }

    fn key_of<'a>(&self, entry: &'a Value) -> Option<&'a str> {
        match entry {
            Value::String(id) => Some(id),
            Value::Object(fields) => fields.get(&self.key_field).and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn ids(&self, list: ModerationList) -> Result<Vec<PlayerId>, AdminError> {
        Ok(self
            .read(list)?
            .iter()
            .filter_map(|entry| self.key_of(entry).map(str::to_string))
            .collect())
    }

    /// Insert or update the player's entry, merging `fields` into it.
    pub fn upsert(
        &self,
        list: ModerationList,
        player: &str,
        fields: Map<String, Value>,
    ) -> Result<(), AdminError> {
        let mut entries = self.read(list)?;
        let existing = entries
            .iter()
            .position(|entry| self.key_of(entry).is_some_and(|id| id.eq_ignore_ascii_case(player)));

        match existing {
            Some(index) => {
                if let Value::Object(current) = &mut entries[index] {
                    current.extend(fields);
                } else {
                    entries[index] = self.entry(player, fields);
                }
            }
            None => entries.push(self.entry(player, fields)),
        }
        self.write(list, &entries)?;
        info!("added {player} to the {list}");
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, list: ModerationList, player: &str) -> Result<bool, AdminError> {
        let mut entries = self.read(list)?;
        let before = entries.len();
        entries.retain(|entry| !self.key_of(entry).is_some_and(|id| id.eq_ignore_ascii_case(player)));
        if entries.len() == before {
            return Ok(false);
        }
        self.write(list, &entries)?;
        info!("removed {player} from the {list}");
        Ok(true)
    }

    fn entry(&self, player: &str, fields: Map<String, Value>) -> Value {
        let mut object = Map::new();
        object.insert(self.key_field.clone(), Value::String(player.to_string()));
        object.extend(fields);
        Value::Object(object)
    }

    pub fn snapshot(&self) -> Result<ModerationSnapshot, AdminError> {
        Ok(ModerationSnapshot {
            whitelist: self.ids(ModerationList::Whitelist)?,
            banned: self.ids(ModerationList::Banned)?,
            operators: self.ids(ModerationList::Operators)?,
        })
    }
}
