pub mod access;
pub mod concurrency;
pub mod context;
pub mod database;
pub mod record;
pub mod storage;
