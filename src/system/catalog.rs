//! Registry of open tables and the database-directory lifecycle.
//!
//! A database is a directory; each table is a `.tbl` heap file in it and
//! each index a `.idx` tree file named after the table and its columns.
//! DDL here is deliberately serial (callers guard it with coarse table
//! locks); the catalog map itself is behind an `RwLock` only so lookups
//! can run concurrently with DML.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;

use super::table::{Table, TableIndex};
use crate::errors::{DbError, Result};
use crate::index::{IndexCol, IndexHandle};
use crate::record::HeapFile;
use crate::storage::{BufferPool, DiskManager};
use crate::types::{ColMeta, ColType};

pub const TABLE_FILE_EXTENSION: &str = "tbl";
pub const INDEX_FILE_EXTENSION: &str = "idx";

pub struct Catalog {
    base: PathBuf,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Catalog {
    /// Creates a database directory. Fails if it already exists.
    pub fn create_database<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(DbError::DatabaseExists(path.display().to_string()));
        }
        std::fs::create_dir_all(path)?;
        debug!("created database '{}'", path.display());
        Ok(())
    }

    /// Removes a database directory and everything in it.
    pub fn drop_database<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(DbError::DatabaseNotFound(path.display().to_string()));
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    /// Opens a catalog over an existing database directory.
    pub fn open<P: AsRef<Path>>(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        path: P,
    ) -> Result<Catalog> {
        let base = path.as_ref().to_path_buf();
        if !base.is_dir() {
            return Err(DbError::DatabaseNotFound(base.display().to_string()));
        }
        Ok(Catalog {
            base,
            disk,
            pool,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.base.join(format!("{name}.{TABLE_FILE_EXTENSION}"))
    }

    fn index_path(&self, index_name: &str) -> PathBuf {
        self.base.join(format!("{index_name}.{INDEX_FILE_EXTENSION}"))
    }

    fn index_name(table_name: &str, col_names: &[&str]) -> String {
        let mut name = table_name.to_string();
        for col in col_names {
            name.push('_');
            name.push_str(col);
        }
        name
    }

    /// Creates a table file and registers the open table. Column widths
    /// for Int and Float are fixed at 4 bytes regardless of the declared
    /// length.
    pub fn create_table(
        &self,
        name: &str,
        col_specs: &[(&str, ColType, usize)],
    ) -> Result<Arc<Table>> {
        if self.tables.read().contains_key(name) {
            return Err(DbError::TableExists(name.to_string()));
        }

        let mut cols = Vec::with_capacity(col_specs.len());
        let mut offset = 0;
        for &(col_name, col_type, declared_len) in col_specs {
            let len = match col_type {
                ColType::Int | ColType::Float => 4,
                ColType::String => declared_len,
            };
            if len == 0 {
                return Err(DbError::internal(format!(
                    "column '{col_name}' of table '{name}' has zero width"
                )));
            }
            cols.push(ColMeta {
                name: col_name.to_string(),
                col_type,
                len,
                offset,
            });
            offset += len;
        }

        let path = self.table_path(name);
        HeapFile::create(&self.disk, &path, offset)?;
        let heap = Arc::new(HeapFile::open(
            Arc::clone(&self.disk),
            Arc::clone(&self.pool),
            &path,
        )?);
        let table = Arc::new(Table::new(name.to_string(), path, cols, heap));
        self.tables
            .write()
            .insert(name.to_string(), Arc::clone(&table));
        debug!("created table '{name}'");
        Ok(table)
    }

    /// Closes and removes a table with all its indexes.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        table.close()?;
        for index in table.indexes().read().iter() {
            IndexHandle::destroy(&self.disk, &index.path)?;
        }
        HeapFile::destroy(&self.disk, table.path())?;
        debug!("dropped table '{name}'");
        Ok(())
    }

    /// Looks up an open table.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Creates a secondary index over `col_names` and backfills it from
    /// the table's current contents.
    pub fn create_index(&self, table_name: &str, col_names: &[&str]) -> Result<()> {
        let table = self.table(table_name)?;
        let index_name = Self::index_name(table_name, col_names);
        {
            let indexes = table.indexes().read();
            if indexes.iter().any(|i| i.name == index_name) {
                return Err(DbError::IndexExists(index_name));
            }
        }

        let col_idxs = table.resolve_cols(col_names)?;
        let index_cols: Vec<IndexCol> = col_idxs
            .iter()
            .map(|&i| {
                let col = &table.cols()[i];
                IndexCol {
                    col_type: col.col_type,
                    len: col.len,
                }
            })
            .collect();

        let path = self.index_path(&index_name);
        IndexHandle::create(&self.disk, &path, &index_cols)?;
        let handle = Arc::new(IndexHandle::open(
            Arc::clone(&self.disk),
            Arc::clone(&self.pool),
            &path,
        )?);

        let index = TableIndex {
            name: index_name.clone(),
            path,
            col_idxs,
            handle,
        };

        // Backfill from every existing row.
        let mut scan = table.heap().scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = table.heap().get(None, rid)?;
            let key = table.extract_key(&record, &index);
            index.handle.insert(&key, rid)?;
            scan.next()?;
        }

        table.indexes().write().push(index);
        debug!("created index '{index_name}'");
        Ok(())
    }

    /// Closes and removes the index over `col_names`.
    pub fn drop_index(&self, table_name: &str, col_names: &[&str]) -> Result<()> {
        let table = self.table(table_name)?;
        let index_name = Self::index_name(table_name, col_names);
        let mut indexes = table.indexes().write();
        let pos = indexes
            .iter()
            .position(|i| i.name == index_name)
            .ok_or(DbError::IndexNotFound(index_name))?;
        let index = indexes.remove(pos);
        index.handle.close()?;
        IndexHandle::destroy(&self.disk, &index.path)?;
        Ok(())
    }

    /// Flushes every open table.
    pub fn flush(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.flush()?;
        }
        Ok(())
    }

    /// Closes every open table and empties the registry.
    pub fn close(&self) -> Result<()> {
        let mut tables = self.tables.write();
        for (_, table) in tables.drain() {
            table.close()?;
        }
        Ok(())
    }
}
