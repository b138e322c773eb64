pub mod config;
pub mod data_dictionary;
pub mod embedding;
