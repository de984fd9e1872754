pub mod config;
pub mod decode;
pub mod fetch;
pub mod geo;
pub mod infra;
pub mod join;
pub mod metrics;
pub mod pipeline;
pub mod records;
pub mod sink;
pub mod source;
pub mod window;
