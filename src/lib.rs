pub mod config;
pub mod errors;
pub mod extraction;
pub mod models;
pub mod proxy;
pub mod services;
pub mod utils;
pub mod web;
