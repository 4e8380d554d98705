pub mod archive;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod directory;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fs_util;
pub mod outcome;
pub mod output;
pub mod pacing;
pub mod parser;
pub mod schedule;
pub mod source;
pub mod sweeper;
