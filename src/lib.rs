pub mod error;
pub mod record;
pub mod topology;
pub mod config;

pub mod broker;
pub mod memory;
#[cfg(feature = "amqp")]
pub mod amqp;

pub mod retry;
pub mod connection;
pub mod producer;

pub mod queue;
pub mod stats;
pub mod receiver;
pub mod processor;
pub mod consumer;

pub mod sink;
pub mod noop_sink;
pub mod memory_sink;
#[cfg(feature = "clickhouse")]
pub mod clickhouse;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod backend;

pub mod init;

pub use consumer::{run_forever, Consumer, PipelineState};
pub use producer::LoggerClient;
pub use record::{Level, LogRecord, MetaValue, Metadata};
pub use sink::LogSink;
