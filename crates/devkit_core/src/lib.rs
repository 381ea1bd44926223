pub mod archive;
pub mod changelog;
pub mod config;
pub mod github;
pub mod mirror;
pub mod prereq;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod runtime;
pub mod solution;
