pub mod chunk;
pub mod db_type;
pub mod error;
pub mod expression;
pub mod page;
pub mod processor;
pub mod program;
pub mod schema;
pub mod stats;
pub mod storage_providers;
pub mod support_types;
pub mod tuple;
