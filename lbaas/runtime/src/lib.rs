#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use bigip_lbaas_core as core;
pub use bigip_lbaas_reconcile as reconcile;

mod admin;
mod agent;
mod args;

pub use self::{
    agent::{Agent, AgentConfig, AgentEvent},
    args::{Args, LogFormat, Runtime},
};
