//! Disposable, isolated workspaces for running coding agents against a copy
//! of a project, with every agent edit recorded as a reversible checkpoint.

pub mod agent;
pub mod cmd;
pub mod config;
pub mod error;
pub mod keys;
pub mod paths;
pub mod remote;
pub mod revision;
pub mod sandbox;
pub mod shell;
pub mod sync;
pub mod tools;
pub mod workspace;

#[cfg(test)]
mod testing;
