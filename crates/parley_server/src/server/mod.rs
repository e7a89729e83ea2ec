#![forbid(unsafe_code)]

pub mod annotations;
pub mod channels;
pub mod commands;
pub mod connections;
pub mod dispatch;
pub mod engine;
pub mod health;
pub mod heartbeat;
pub mod presence;
pub mod sanitize;

#[cfg(test)]
mod channels_tests;


#[cfg(test)]
mod engine_tests;
