pub mod auth;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod heartbeat;
pub mod logbuf;
pub mod restart;
pub mod secret;
pub mod supervisor;
pub mod web;
