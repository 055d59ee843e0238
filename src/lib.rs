pub mod bus;
pub mod clock;
pub mod config;
pub mod consts;
pub mod dashboard;
pub mod migration;
pub mod models;
pub mod repository;
pub mod services;
pub mod store;
pub mod utils;
