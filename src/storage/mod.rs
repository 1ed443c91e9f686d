mod db;

pub use db::{ResetScope, StateDb, StatusCounts};
