pub mod app;
pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod network;
pub mod output;
pub mod pipectl_cli;
pub mod plugin;
pub mod proctree;
pub mod registry;
pub mod rpc;
pub mod supervisor;
