//! Library crate for drawi-back, exposing modules for the binary and integration tests.

pub mod config;
pub mod dao;
pub mod error;
pub mod reasoning;
pub mod services;
pub mod social;
pub mod state;
