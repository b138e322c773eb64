pub mod collection;
pub mod db;
pub mod types;
