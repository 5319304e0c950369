//! Generation backend: the client trait, provider implementations and stage prompts.

pub mod client;
pub mod client_impl;
pub mod factory;
pub mod prompts;
