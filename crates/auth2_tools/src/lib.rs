#![forbid(unsafe_code)]

pub mod forward;
pub mod key_cli;
pub mod shell;
pub mod terminal;
