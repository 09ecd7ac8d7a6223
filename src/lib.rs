pub mod collaborators;
pub mod config;
pub mod dag;
pub mod errors;
pub mod fabric;
pub mod hail;
pub mod phase;
pub mod phase_loop;
pub mod review;
pub mod worker_group;
