pub mod classify;
pub mod connection;
pub mod pipeline;
pub mod rules;
pub mod updater;
