pub mod block;
pub mod column;
pub mod config;
pub mod encoding;
pub mod error;
pub mod hasher;
pub mod hist;
pub mod lock;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod table;

#[cfg(test)]
mod tmpfs;

pub use config::{Config, LockConfig};
pub use error::{Error, Result};
pub use hist::{HistKind, Histogram};
pub use lock::LockKind;
pub use query::{
    AggOp, Filter, GroupResult, IntOp, QueryParams, QueryResults, QuerySpec, SetOp, StrOp,
};
pub use record::{FieldType, Row, Value};
pub use scheduler::{DigestTask, Scheduler};
pub use table::{LoadSpec, QueryStats, Registry, Table, TrimSpec};
