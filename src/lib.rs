//! An embedded transactional table store.
//!
//! Everything lives in one append-only file: data records, copy-on-write
//! btree nodes and checksummed commit blocks. Opening a database scans back
//! to the last good commit, so a crash can only lose the commits that were
//! not yet written.

pub mod btree;
pub mod catalog;
pub mod check;
pub mod config;
mod database;
pub mod dbms;
mod digest;
pub mod error;
mod flock;
mod indexed;
pub mod log;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod tran;

pub use check::CheckReport;
pub use config::{DbConfig, SchedulerConfig};
pub use database::Database;
pub use error::{Error, Result};
pub use log::Status;
pub use record::{Record, RecordBuilder, Value};
pub use scheduler::Scheduler;
pub use schema::{Request, TableBuilder};
pub use tran::{ReadTransaction, TableIter, TranRead, UpdateTransaction};
