pub mod batcher;
pub mod canary;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod lag;
pub mod pipeline;
pub mod poster;
pub mod queue;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod test_support;
