pub mod dictdb;
pub mod engine;
pub mod error;
pub mod heap;
pub mod index;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod timeseries;
pub mod vptree;
pub mod wal;

pub use dictdb::DictDb;
pub use engine::{DbParams, PersistentDb, Row, TimeSeriesDb, TESTING_NAME};
pub use error::{Result, TsdbError};
pub use index::{BitmapIndex, CompareOp, Index, PkIndex, TreeIndex};
pub use query::{Query, Selection};
pub use schema::{FieldDef, FieldType, FieldValue, IndexKind, Schema, TS_FIELD};
pub use timeseries::TimeSeries;
pub use vptree::{VpNode, VpTree};
