pub mod accounts;
pub mod config;
pub mod domain;
pub mod fetcher;
pub mod gate;
pub mod groups;
pub mod notification;
pub mod paths;
pub mod pipeline;
pub mod processes;
pub mod reconcile;
pub mod state;
pub mod version;
