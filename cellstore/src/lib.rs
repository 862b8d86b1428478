pub mod error;
pub mod listeners;
pub mod persister;
pub mod schema;
pub mod serialization;
pub mod store;
pub mod transaction;
pub mod types;
mod validation;

pub use error::{CellStoreError, Result};
pub use listeners::ListenerId;
pub use persister::{FileStorage, Persister, PersisterStats, SqliteStorage, Status, Storage};
pub use schema::{parse_schema, parse_schema_str, CellSchema, SchemaDefinition};
pub use store::Store;
pub use transaction::{Change, Changes, TransactionLog};
pub use types::{Content, Scalar, ScalarType, SortedRowIdsArgs};
