// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-database in-memory state held by the cache server: the value
//! cache, the modified/accessed bookkeeping, and the preload logic
//! behind the three load modes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::catalog::TableInfo;
use crate::{Error, MarDb, Record, Value};

/// How much of a database to pull into memory when it is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LoadMode {
    /// Read every table up front.
    Full,
    /// Preload whatever the `.marl` sidecar lists.
    Part,
    /// Load records on first access.
    Fast,
}

impl FromStr for LoadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "full" => Ok(LoadMode::Full),
            "part" => Ok(LoadMode::Part),
            "fast" => Ok(LoadMode::Fast),
            other => Err(Error::Protocol(format!("unknown load mode: {other}"))),
        }
    }
}

#[derive(Debug, Default)]
struct TableCache {
    cached: HashMap<Vec<i16>, Value>,
    modified: HashSet<Vec<i16>>,
    accessed: HashSet<Vec<i16>>,
}

/// One loaded database.
#[derive(Debug)]
pub struct ActiveDb {
    pub engine: MarDb,
    pub mode: LoadMode,
    pub loaded_at: DateTime<Utc>,
    pub tables: BTreeMap<u16, TableInfo>,
    pub files: BTreeMap<u16, Vec<String>>,
    cache: HashMap<String, TableCache>,
}

impl ActiveDb {
    /// Opens the database and preloads according to `mode`.
    pub fn load(db_name: &str, mode: LoadMode) -> Result<Self, Error> {
        let engine = MarDb::open(db_name)?;
        let mut db = Self {
            engine,
            mode,
            loaded_at: Utc::now(),
            tables: BTreeMap::new(),
            files: BTreeMap::new(),
            cache: HashMap::new(),
        };
        db.refresh_metadata()?;
        db.preload()?;
        info!(mode = ?mode, "loaded database {db_name}");
        Ok(db)
    }

    /// Re-reads the catalog snapshot (after `create_table`).
    pub fn refresh_metadata(&mut self) -> Result<(), Error> {
        self.tables = self.engine.tables()?;
        self.files = self.engine.table_files(None)?;
        Ok(())
    }

    /// Applies the load mode once more (used by an explicit
    /// `load_database` on an already-loaded database).
    pub fn preload(&mut self) -> Result<(), Error> {
        match self.mode {
            LoadMode::Full => {
                let names: Vec<String> = self.tables.values().map(|t| t.name.clone()).collect();
                for name in names {
                    self.preload_table(&name);
                }
            }
            LoadMode::Part => self.apply_sidecar(),
            LoadMode::Fast => {}
        }
        Ok(())
    }

    fn table_cache(&mut self, table: &str) -> &mut TableCache {
        self.cache.entry(table.to_string()).or_default()
    }

    fn preload_table(&mut self, table: &str) {
        match self.engine.select_all(table) {
            Ok(records) => {
                let count = records.len();
                let cache = self.table_cache(table);
                for record in records {
                    cache.accessed.insert(record.cords.clone());
                    cache.cached.insert(record.cords, record.value);
                }
                info!("preloaded table {table}: {count} records");
            }
            Err(e) => warn!("failed to preload table {table}: {e}"),
        }
    }

    fn preload_case(&mut self, table: &str, cords: &[i16]) {
        if self
            .cache
            .get(table)
            .is_some_and(|c| c.cached.contains_key(cords))
        {
            return;
        }
        match self.engine.find(table, cords) {
            Ok(Some(record)) => {
                let cache = self.table_cache(table);
                cache.accessed.insert(record.cords.clone());
                cache.cached.insert(record.cords, record.value);
            }
            Ok(None) => {}
            Err(e) => warn!("failed to preload {cords:?} from {table}: {e}"),
        }
    }

    /// Parses the `.marl` sidecar next to the catalog: blank lines and
    /// `#` comments are skipped, `load_table: <name>` preloads a table,
    /// `load_case: <name>, c0, c1, ...` preloads one tuple.
    fn apply_sidecar(&mut self) {
        let sidecar = PathBuf::from(format!("{}.marl", self.engine.path().display()));
        let text = match std::fs::read_to_string(&sidecar) {
            Ok(text) => text,
            Err(_) => {
                debug!("no sidecar at {}", sidecar.display());
                return;
            }
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix("load_table:") {
                self.preload_table(name.trim());
            } else if let Some(rest) = line.strip_prefix("load_case:") {
                let mut parts = rest.split(',');
                let Some(table) = parts.next().map(str::trim) else {
                    continue;
                };
                let cords: Result<Vec<i16>, _> =
                    parts.map(|c| c.trim().parse::<i16>()).collect();
                match cords {
                    Ok(cords) if !cords.is_empty() => self.preload_case(table, &cords),
                    _ => warn!("skipping bad sidecar line: {line}"),
                }
            } else {
                warn!("skipping bad sidecar line: {line}");
            }
        }
    }

    /// Declared arity of a table, from the catalog snapshot.
    pub fn expected_arity(&self, table: &str) -> Result<u16, Error> {
        self.tables
            .values()
            .find(|t| t.name == table)
            .map(TableInfo::arity)
            .ok_or_else(|| Error::NotFound(format!("table {table}")))
    }

    /// Rejects tuples that could never address a slot of `table`;
    /// caching them would poison the flush loop.
    pub fn check_arity(&self, table: &str, cords: &[i16]) -> Result<(), Error> {
        let arity = self.expected_arity(table)?;
        if cords.len() != arity as usize {
            return Err(Error::Malformed(format!(
                "cord arity {} does not match table arity {arity}",
                cords.len()
            )));
        }
        Ok(())
    }

    /// Cache-first lookup; a miss goes to disk and populates the cache.
    pub fn find(&mut self, table: &str, cords: &[i16]) -> Result<Option<Record>, Error> {
        if let Some(cache) = self.cache.get_mut(table) {
            if let Some(value) = cache.cached.get(cords) {
                let value = value.clone();
                cache.accessed.insert(cords.to_vec());
                return Ok(Some(Record {
                    cords: cords.to_vec(),
                    value,
                }));
            }
        }
        let Some(record) = self.engine.find(table, cords)? else {
            return Ok(None);
        };
        let cache = self.table_cache(table);
        cache.accessed.insert(record.cords.clone());
        cache.cached.insert(record.cords.clone(), record.value.clone());
        Ok(Some(record))
    }

    /// Write-through to the cache only; the flush task owns the disk.
    pub fn insert(&mut self, table: &str, cords: Vec<i16>, value: Value) {
        let cache = self.table_cache(table);
        cache.cached.insert(cords.clone(), value);
        cache.modified.insert(cords.clone());
        cache.accessed.insert(cords);
    }

    /// Cached rows if any exist for the table, otherwise a full read
    /// that populates the cache.
    pub fn select(&mut self, table: &str) -> Result<Vec<Record>, Error> {
        if let Some(cache) = self.cache.get_mut(table) {
            if !cache.cached.is_empty() {
                return Ok(cache
                    .cached
                    .iter()
                    .map(|(cords, value)| Record {
                        cords: cords.clone(),
                        value: value.clone(),
                    })
                    .collect());
            }
        }
        let records = self.engine.select_all(table)?;
        let cache = self.table_cache(table);
        for record in &records {
            cache.accessed.insert(record.cords.clone());
            cache.cached.insert(record.cords.clone(), record.value.clone());
        }
        Ok(records)
    }

    /// Snapshot of everything pending flush. Does not clear the
    /// modified sets; call [`ActiveDb::clear_flushed`] with what
    /// actually made it to disk.
    pub fn take_dirty(&self) -> Vec<(String, Vec<i16>, Value)> {
        let mut dirty = Vec::new();
        for (table, cache) in &self.cache {
            for cords in &cache.modified {
                if let Some(value) = cache.cached.get(cords) {
                    dirty.push((table.clone(), cords.clone(), value.clone()));
                }
            }
        }
        dirty
    }

    pub fn clear_flushed(&mut self, flushed: &[(String, Vec<i16>)]) {
        for (table, cords) in flushed {
            if let Some(cache) = self.cache.get_mut(table) {
                cache.modified.remove(cords);
            }
        }
    }

    pub fn has_dirty(&self) -> bool {
        self.cache.values().any(|c| !c.modified.is_empty())
    }
}
