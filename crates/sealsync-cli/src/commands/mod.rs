//! Command handlers

pub mod clear;
pub mod config;
pub mod doc;
pub mod init;
pub mod ops;
pub mod status;
pub mod sync;
