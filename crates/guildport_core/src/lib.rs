pub mod config;
pub mod convert;
pub mod discord;
pub mod migrate;
pub mod permissions;
pub mod scan;
pub mod stoat;
