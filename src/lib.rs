pub mod app;
pub mod config;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod frame;
pub mod fs_util;
pub mod locator;
pub mod merge;
pub mod metadata;
pub mod normalize;
pub mod output;
pub mod package;
pub mod pipeline;
pub mod processor;
pub mod records;
pub mod scale;
pub mod smasher;
pub mod stats;
pub mod store;
