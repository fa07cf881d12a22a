use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::table::io::{INFO_FILE, INFO_FLAG};
use crate::table::row_store::INGEST_DIR;
use crate::table::Table;

/// Open tables of one engine instance, by name. Every table shares the
/// registry's config.
pub struct Registry {
    config: Arc<Config>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The table `name`, opened on first use.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(table.clone());
        }
        validate_name(name)?;

        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }
        let table = Arc::new(Table::open(name, self.config.clone())?);
        tables.insert(name.to_string(), table.clone());
        debug!(table = name, "registered table");
        Ok(table)
    }

    /// Forget an open table. Its files are left alone.
    pub fn unregister(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.write().remove(name)
    }

    /// Tables currently open.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().values().cloned().collect()
    }

    /// Names of every table on disk, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::ReadError(self.config.dir.display().to_string(), e)),
        };

        let names = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let dir = entry.path();
                dir.join(INFO_FILE).exists()
                    || dir.join(INFO_FLAG).exists()
                    || dir.join(INGEST_DIR).is_dir()
            })
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .sorted()
            .collect();
        Ok(names)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        return Err(Error::InvalidOperation(format!("invalid table name {:?}", name)));
    }
    Ok(())
}
