pub mod balancer;
pub mod config;
pub mod delegate;
pub mod error;
pub mod events;
pub mod monitor;
mod set;
pub mod socket;
mod sys;
