pub mod desc;
pub mod error;
pub mod types;
