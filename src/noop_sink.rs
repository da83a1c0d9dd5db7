use crate::error::SinkError;
use crate::record::LogRecord;
use crate::sink::LogSink;
use async_trait::async_trait;

/// A sink that simply drops all records.
///
/// Useful for measuring the overhead of the pipeline itself without any
/// storage I/O. Selected with the `noop://` storage DSN.
#[derive(Clone, Default)]
pub struct NoopSink;

#[async_trait]
impl LogSink for NoopSink {
    async fn persist(&self, _record: &LogRecord) -> Result<(), SinkError> {
        Ok(())
    }
}
