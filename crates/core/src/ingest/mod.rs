pub mod coordinator;
pub mod error;
pub mod feed;
pub mod line;
pub mod types;
