pub mod audit;
pub mod cache;
pub mod engine;
pub mod error;
pub mod gate;
pub mod index;
pub mod io;
pub mod item;
pub mod lock;
pub mod migrations;
pub mod paths;
pub mod store;
pub mod template;
pub mod txn;

pub use error::{Result, WorklineError};
