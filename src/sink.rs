use crate::error::SinkError;
use crate::record::LogRecord;
use async_trait::async_trait;

/// Durable storage for [`LogRecord`]s drained by the consumer pipeline.
///
/// Implementations are responsible for writing records to a concrete
/// backend (Postgres, ClickHouse, etc). Batch processors call `persist`
/// once per record, possibly from several tasks at the same time, so
/// implementations must be safe to share.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Write a single log record.
    ///
    /// **Parameters**
    /// - `record`: decoded [`LogRecord`] as published by the producer.
    ///
    /// **Returns**
    /// - `Ok(())` if the backend accepted the record.
    /// - `Err(..)` if the write failed. The processor reports the failure
    ///   and moves on to the next record in the batch; the record is not
    ///   retried or requeued.
    async fn persist(&self, record: &LogRecord) -> Result<(), SinkError>;

    /// Flush any buffered records, if the backend implements buffering.
    ///
    /// Called by the processors on shutdown. Default implementation is a
    /// no-op.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
