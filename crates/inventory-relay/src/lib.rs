pub mod buffers;
pub mod config;
pub mod errors;
pub mod inventory;
pub mod kinesis;
pub mod listener;
pub mod relay;
pub mod sink;
pub mod sts;

#[cfg(test)]
mod testing;
