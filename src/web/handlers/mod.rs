//! HTTP request handlers organized by domain

pub mod api;
pub mod health;
pub mod streams;
