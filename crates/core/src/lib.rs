#![deny(warnings)]

pub mod config;
pub mod content;
pub mod emotion;
pub mod grammar;
pub mod llm;
pub mod media;
pub mod pipeline;
pub mod prosody;
pub mod transcribe;
pub mod util;
