//! Side-effecting adapters: git, filesystem, containers, configuration.

pub mod config;
pub mod git;
pub mod guard;
pub mod metadata;
pub mod process;
pub mod publish;
pub mod sandbox;
pub mod verify;
pub mod workspace;
