pub mod archive;
pub mod checkpoint;
pub mod db;
pub mod documents;
pub mod error_log;
pub mod export;
