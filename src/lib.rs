pub mod app;
pub mod booking;
pub mod catalog;
pub mod config;
pub mod http;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod slots;
pub mod store;
pub mod tasks;
