pub mod api;
pub mod checker;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod layout;
pub mod logging;
pub mod maintenance;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod retrieval;
pub mod store;
pub mod worker;
