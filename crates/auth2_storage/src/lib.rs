#![forbid(unsafe_code)]

pub mod token_store;
