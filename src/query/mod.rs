pub mod aggregate;
pub mod distinct;
pub mod filter;
pub mod merge;
pub mod params;

pub use aggregate::Scanner;
pub use distinct::HyperLogLog;
pub use filter::{Filter, IntOp, SetOp, StrOp};
pub use params::{
    AggOp, Aggregation, GroupResult, Grouping, QueryParams, QueryResults, QuerySpec, ResultMap,
    TimeBucket, WeightColumn,
};
