pub mod db;
pub mod executor;

pub use executor::{execute_transaction, BlockContext, ExecutionResult};
