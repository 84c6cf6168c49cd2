mod db;
mod models;

pub use db::{BuildFinish, FailOutcome, Store};
pub use models::*;
