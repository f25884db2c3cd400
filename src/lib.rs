pub mod catalog;
pub mod codec;
pub mod config;
pub mod database;
pub mod recovery;
pub mod storage;
pub mod tier;
