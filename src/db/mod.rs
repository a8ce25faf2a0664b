// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The storage engine: catalog plus slot files, orchestrated behind a
//! stateless handle. Every operation opens the files it needs and
//! closes them on return; callers that need serialization across
//! operations provide it themselves (the cache server does).

pub mod case;
pub mod catalog;
pub mod slot;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Value};
use catalog::{Catalog, TableConfig, TableInfo};
use slot::SlotFile;

/// One stored record: a cord tuple and its typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub cords: Vec<i16>,
    pub value: Value,
}

/// Handle on a catalog path. Cheap to clone; owns no open files.
#[derive(Debug, Clone)]
pub struct MarDb {
    path: PathBuf,
}

impl MarDb {
    /// Creates a fresh database at `path`, truncating any existing
    /// catalog there.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        Catalog::create(&path)?;
        debug!("created database {}", path.display());
        Ok(Self { path })
    }

    /// Opens an existing database.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::NotFound(format!("catalog {}", path.display())));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the catalog lives in; data and config paths resolve
    /// against it.
    fn base_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn data_dir(&self, catalog: &Catalog) -> PathBuf {
        self.base_dir().join(&catalog.data_dir)
    }

    fn config_path(&self, table: &str) -> PathBuf {
        self.base_dir().join("config").join(format!("{table}.mart"))
    }

    /// Declares a table and creates its config and first data file.
    pub fn create_table(&self, name: &str, axes: &[String]) -> Result<TableInfo, Error> {
        let info = Catalog::add_table(&self.path, name, axes)?;
        let catalog = Catalog::load(&self.path)?;

        let data_dir = self.data_dir(&catalog);
        std::fs::create_dir_all(&data_dir)?;
        let file_name = format!("{name}_1.marc");
        SlotFile::create(&data_dir.join(&file_name), info.id, info.arity())?;

        let config_dir = self.base_dir().join("config");
        std::fs::create_dir_all(&config_dir)?;
        TableConfig {
            table_id: info.id,
            files: vec![file_name],
        }
        .write(&self.config_path(name))?;

        debug!("created table {name} in {}", self.path.display());
        Ok(info)
    }

    /// All table descriptors, keyed by id.
    pub fn tables(&self) -> Result<BTreeMap<u16, TableInfo>, Error> {
        let catalog = Catalog::load(&self.path)?;
        Ok(catalog.tables.into_iter().map(|t| (t.id, t)).collect())
    }

    /// Data file names per table id, optionally restricted to one
    /// table. Tables whose config file is missing are skipped.
    pub fn table_files(&self, table: Option<&str>) -> Result<BTreeMap<u16, Vec<String>>, Error> {
        let catalog = Catalog::load(&self.path)?;
        let mut out = BTreeMap::new();
        for info in &catalog.tables {
            if table.is_some_and(|name| name != info.name) {
                continue;
            }
            match TableConfig::load(&self.config_path(&info.name)) {
                Ok(config) => {
                    out.insert(info.id, config.files);
                }
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Resolved data file paths for one table, in config order.
    fn data_files(&self, table: &str) -> Result<Vec<PathBuf>, Error> {
        let catalog = Catalog::load(&self.path)?;
        if catalog.table(table).is_none() {
            return Err(Error::NotFound(format!(
                "table {table} in {}",
                self.path.display()
            )));
        }
        let config = TableConfig::load(&self.config_path(table))?;
        let data_dir = self.data_dir(&catalog);
        Ok(config.files.iter().map(|f| data_dir.join(f)).collect())
    }

    /// Point lookup across the table's data files.
    pub fn find(&self, table: &str, cords: &[i16]) -> Result<Option<Record>, Error> {
        for path in self.data_files(table)? {
            let mut slots = SlotFile::open(&path)?;
            if let Some(record) = slots.find(cords)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Writes a record, trying each data file in config order; a full
    /// file falls through to the next one. Returns whether a file
    /// accepted the record.
    pub fn insert(&self, table: &str, cords: &[i16], value: &Value) -> Result<bool, Error> {
        let mut full = None;
        for path in self.data_files(table)? {
            let mut slots = SlotFile::open(&path)?;
            match slots.insert(cords, value) {
                Ok(()) => return Ok(true),
                Err(Error::CapacityExceeded(n)) => full = Some(Error::CapacityExceeded(n)),
                Err(e) => return Err(e),
            }
        }
        match full {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Every record of the table, in file and directory order.
    pub fn select_all(&self, table: &str) -> Result<Vec<Record>, Error> {
        let mut records = Vec::new();
        for path in self.data_files(table)? {
            let mut slots = SlotFile::open(&path)?;
            records.append(&mut slots.select_all()?);
        }
        Ok(records)
    }

    /// Rewrites every data file of every table without heap holes.
    pub fn defragment(&self) -> Result<(), Error> {
        let catalog = Catalog::load(&self.path)?;
        for info in &catalog.tables {
            for path in self.data_files(&info.name)? {
                SlotFile::defragment(&path)?;
            }
        }
        debug!("defragmented {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn axes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn open_missing_catalog_is_not_found() {
        let err = MarDb::open("/nonexistent/void.marm").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");
    }

    #[test]
    fn create_table_lays_out_files() {
        let dir = tempdir().unwrap();
        let db = MarDb::create(dir.path().join("main.marm")).unwrap();
        db.create_table("t1", &axes(&["a", "b", "c"])).unwrap();

        assert!(dir.path().join("cases/t1_1.marc").is_file());
        assert!(dir.path().join("config/t1.mart").is_file());

        let tables = db.tables().unwrap();
        assert_eq!(tables[&1].name, "t1");
        assert_eq!(tables[&1].axes, axes(&["a", "b", "c"]));
        assert_eq!(
            db.table_files(None).unwrap()[&1],
            vec!["t1_1.marc".to_string()]
        );
        assert_eq!(db.table_files(Some("other")).unwrap().len(), 0);
    }

    #[test]
    fn insert_find_select() {
        let dir = tempdir().unwrap();
        let db = MarDb::create(dir.path().join("main.marm")).unwrap();
        db.create_table("t1", &axes(&["a", "b", "c"])).unwrap();

        assert!(db.insert("t1", &[123, 2, -1], &Value::Str("TEST1".into())).unwrap());
        let record = db.find("t1", &[123, 2, -1]).unwrap().unwrap();
        assert_eq!(record.value, Value::Str("TEST1".into()));
        assert!(db.find("t1", &[0, 0, 0]).unwrap().is_none());
        assert_eq!(db.select_all("t1").unwrap().len(), 1);
    }

    #[test]
    fn unknown_table_is_not_found() {
        let dir = tempdir().unwrap();
        let db = MarDb::create(dir.path().join("main.marm")).unwrap();
        let err = db.find("ghost", &[1]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");
    }
}
