//! Local SQL driver abstraction
//!
//! The dispatcher executes client requests against objects implementing
//! these traits. A [`DriverRegistry`] maps the driver name carried by an
//! Open request to a factory creating an unopened [`SqlDatabase`].

pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlipc_client::{ColType, Value};

use crate::error::{DbError, DbResult};

pub use sqlite::SqliteDatabase;

pub type SharedDatabase = Arc<Mutex<Box<dyn SqlDatabase>>>;
pub type SharedStatement = Arc<Mutex<Box<dyn SqlStatement>>>;
pub type SharedCursor = Arc<Mutex<Box<dyn SqlCursor>>>;

/// Where to open a database and as whom
#[derive(Debug, Clone, Copy)]
pub struct OpenTarget<'a> {
    pub dbname: &'a str,
    pub user: &'a str,
    pub host: Option<&'a str>,
    pub port: u16,
}

pub trait SqlDatabase: Send {
    fn open(&mut self, target: &OpenTarget<'_>, password: Option<&str>) -> DbResult<()>;

    fn close(&mut self) -> DbResult<()>;

    fn prepare(&mut self, text: &str) -> DbResult<Box<dyn SqlStatement>>;

    /// Run statements that return no rows
    fn execute(&mut self, text: &str) -> DbResult<()>;
}

pub trait SqlStatement: Send {
    fn parameter_count(&self) -> usize;

    fn parameter_name(&self, idx: usize) -> DbResult<String>;

    /// Bind a value to the zero-based parameter `idx`
    fn bind(&mut self, idx: usize, value: &Value) -> DbResult<()>;

    /// Execute with the bound parameters; zero flags runs the statement
    /// immediately and yields no cursor
    fn execute(&mut self, flags: u32) -> DbResult<Option<Box<dyn SqlCursor>>>;
}

/// Result set positioned on one row at a time
pub trait SqlCursor: Send {
    fn flags(&self) -> u32;

    fn columns(&self) -> u32;

    /// Total rows, or -1 when the driver cannot tell
    fn rows(&self) -> i64;

    /// Current row
    fn at(&self) -> i64;

    /// Move to `row`, returning false when it lies past the end
    fn seek(&mut self, row: i64) -> DbResult<bool>;

    fn next(&mut self) -> DbResult<bool>;

    fn at_end(&self) -> bool;

    fn data(&self, col: u32) -> DbResult<Value>;

    fn header(&self, col: u32) -> DbResult<String>;

    fn column_type(&self, col: u32) -> DbResult<ColType>;

    /// Independent cursor over the same results, at the same row
    fn copy(&self) -> DbResult<Box<dyn SqlCursor>>;
}

pub fn shared<T: ?Sized>(object: Box<T>) -> Arc<Mutex<Box<T>>> {
    Arc::new(Mutex::new(object))
}

type DriverFactory = Arc<dyn Fn() -> Box<dyn SqlDatabase> + Send + Sync>;

/// Named factories for local database drivers
#[derive(Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Registry with the built-in `sqlite` driver
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("sqlite", || Box::new(SqliteDatabase::new()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn SqlDatabase> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> DbResult<Box<dyn SqlDatabase>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| DbError::UnknownDriver(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
