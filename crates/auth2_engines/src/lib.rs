#![forbid(unsafe_code)]

pub mod key_envelope;
pub mod protected_storage;
pub mod secret_cipher;
pub mod totp;
