use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;
use warden_proto::proto::ModLoadout;

use crate::errors::LoadoutError;
use crate::util::write_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoadoutFile {
    #[serde(default)]
    loadouts: Vec<ModLoadout>,
    #[serde(default)]
    selected: Option<String>,
}

/// Named mod loadouts plus the one selected for the next start.
pub struct LoadoutStore {
    path: PathBuf,
    file: Mutex<LoadoutFile>,
    /// Loadout the running server was started with.
    pinned: Mutex<Option<String>>,
}

impl LoadoutStore {
    pub fn open(path: PathBuf) -> Result<Self, LoadoutError> {
        let file = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|err| {
                LoadoutError::io(
                    format!("parsing {}", path.display()),
                    io::Error::new(io::ErrorKind::InvalidData, err),
                )
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => LoadoutFile::default(),
            Err(err) => return Err(LoadoutError::io(format!("reading {}", path.display()), err)),
        };
        Ok(Self {
            path,
            file: Mutex::new(file),
            pinned: Mutex::new(None),
        })
    }

    fn file(&self) -> MutexGuard<'_, LoadoutFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pinned(&self) -> MutexGuard<'_, Option<String>> {
        self.pinned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list(&self) -> (Vec<ModLoadout>, Option<String>) {
        let file = self.file();
        (file.loadouts.clone(), file.selected.clone())
    }

    /// Create or replace a loadout. `server_active` is whether a server process exists.
    pub fn save(&self, loadout: ModLoadout, server_active: bool) -> Result<(), LoadoutError> {
        let loadout = validate(loadout)?;
        self.ensure_mutable(&loadout.name, server_active)?;

        let mut file = self.file();
        let mut next = file.clone();
        match next.loadouts.iter_mut().find(|l| l.name == loadout.name) {
            Some(existing) => *existing = loadout.clone(),
            None => next.loadouts.push(loadout.clone()),
        }
        self.persist(&next)?;
        *file = next;
        info!("saved loadout {} ({} mods)", loadout.name, loadout.mods.len());
        Ok(())
    }

    pub fn delete(&self, name: &str, server_active: bool) -> Result<(), LoadoutError> {
        self.ensure_mutable(name, server_active)?;

        let mut file = self.file();
        let mut next = file.clone();
        let before = next.loadouts.len();
        next.loadouts.retain(|l| l.name != name);
        if next.loadouts.len() == before {
            return Err(LoadoutError::NotFound(name.to_string()));
        }
        if next.selected.as_deref() == Some(name) {
            next.selected = None;
        }
        self.persist(&next)?;
        *file = next;
        info!("deleted loadout {name}");
        Ok(())
    }

    /// Choose the loadout for the next start; `None` starts without extra mods.
    pub fn select(&self, name: Option<String>) -> Result<(), LoadoutError> {
        let mut file = self.file();
        if let Some(name) = &name {
            if !file.loadouts.iter().any(|l| &l.name == name) {
                return Err(LoadoutError::NotFound(name.clone()));
            }
        }
        let mut next = file.clone();
        next.selected = name;
        self.persist(&next)?;
        *file = next;
        Ok(())
    }

    pub fn selected(&self) -> Option<ModLoadout> {
        let file = self.file();
        let name = file.selected.as_ref()?;
        file.loadouts.iter().find(|l| &l.name == name).cloned()
    }

    /// Record which loadout the server was started with.
    pub fn pin(&self, name: Option<String>) {
        *self.pinned() = name;
    }

    fn ensure_mutable(&self, name: &str, server_active: bool) -> Result<(), LoadoutError> {
        if server_active && self.pinned().as_deref() == Some(name) {
            return Err(LoadoutError::InUse(name.to_string()));
        }
        Ok(())
    }

    fn persist(&self, file: &LoadoutFile) -> Result<(), LoadoutError> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|err| LoadoutError::io("encoding loadouts", io::Error::other(err)))?;
        write_atomic(&self.path, &json)
            .map_err(|err| LoadoutError::io(format!("writing {}", self.path.display()), err))
    }
}

/// Extra launch arguments for a loadout: `flag path` once per mod, in order.
pub fn launch_args(loadout: &ModLoadout, flag: &str) -> Vec<String> {
    loadout
        .mods
        .iter()
        .flat_map(|m| [flag.to_string(), m.path.display().to_string()])
        .collect()
}

fn validate(mut loadout: ModLoadout) -> Result<ModLoadout, LoadoutError> {
    loadout.name = loadout.name.trim().to_string();
    if loadout.name.is_empty() {
        return Err(LoadoutError::Invalid("loadout name is empty".into()));
    }
    let mut seen = BTreeSet::new();
    for m in &loadout.mods {
        if m.path.as_os_str().is_empty() {
            return Err(LoadoutError::Invalid(format!("{}: mod path is empty", loadout.name)));
        }
        if m.tag.trim().is_empty() {
            return Err(LoadoutError::Invalid(format!(
                "{}: mod {} has no checksum or version tag",
                loadout.name,
                m.path.display()
            )));
        }
        if !seen.insert(m.path.clone()) {
            return Err(LoadoutError::Invalid(format!(
                "{}: mod {} listed twice",
                loadout.name,
                m.path.display()
            )));
        }
    }
    Ok(loadout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::proto::ModRef;

    fn loadout(name: &str, mods: &[&str]) -> ModLoadout {
        ModLoadout {
            name: name.to_string(),
            mods: mods
                .iter()
                .map(|path| ModRef {
                    path: PathBuf::from(path),
                    tag: "1.0.0".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn saved_loadouts_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loadouts.json");
        let store = LoadoutStore::open(path.clone()).expect("open");
        store.save(loadout("survival", &["mods/a.zip", "mods/b.zip"]), false).expect("save");
        store.select(Some("survival".into())).expect("select");

        let reopened = LoadoutStore::open(path).expect("reopen");
        let (loadouts, selected) = reopened.list();
        assert_eq!(loadouts.len(), 1);
        assert_eq!(selected.as_deref(), Some("survival"));
        assert_eq!(
            launch_args(&reopened.selected().expect("selected"), "--addModPath"),
            ["--addModPath", "mods/a.zip", "--addModPath", "mods/b.zip"]
        );
    }

    #[test]
    fn pinned_loadout_is_immutable_while_active() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LoadoutStore::open(dir.path().join("loadouts.json")).expect("open");
        store.save(loadout("survival", &["mods/a.zip"]), false).expect("save");
        store.save(loadout("creative", &[]), false).expect("save");
        store.pin(Some("survival".into()));

        assert!(matches!(
            store.save(loadout("survival", &["mods/c.zip"]), true),
            Err(LoadoutError::InUse(_))
        ));
        assert!(matches!(store.delete("survival", true), Err(LoadoutError::InUse(_))));
        store.save(loadout("creative", &["mods/c.zip"]), true).expect("other loadouts stay editable");

        // Once the server is gone the pin no longer blocks edits.
        store.delete("survival", false).expect("delete");
    }

    #[test]
    fn invalid_and_unknown_loadouts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LoadoutStore::open(dir.path().join("loadouts.json")).expect("open");

        assert!(matches!(store.save(loadout("  ", &[]), false), Err(LoadoutError::Invalid(_))));
        assert!(matches!(
            store.save(loadout("dup", &["mods/a.zip", "mods/a.zip"]), false),
            Err(LoadoutError::Invalid(_))
        ));
        assert!(matches!(store.select(Some("nope".into())), Err(LoadoutError::NotFound(_))));
        assert!(matches!(store.delete("nope", false), Err(LoadoutError::NotFound(_))));
        assert!(store.list().0.is_empty());
    }
}
