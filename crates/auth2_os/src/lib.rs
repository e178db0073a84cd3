#![forbid(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod link_ingress;
pub mod local_core;
pub mod readiness_gate;
pub mod runtime;
pub mod token_list;
pub mod token_refresh;
