use log::trace;
use tokio::sync::mpsc;

use crate::error::{Result, SourceError};
use crate::record::Record;

/// Downstream consumer of records
///
/// `accept` is called once per line, in the order the command wrote them.
/// It may wait for capacity; the reader does not read further output until
/// it returns.
#[async_trait::async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Take ownership of one record
    async fn accept(&self, record: Record) -> Result<()>;
}

#[async_trait::async_trait]
impl RecordSink for mpsc::Sender<Record> {
    async fn accept(&self, record: Record) -> Result<()> {
        trace!("Delivering record {} from '{}'", record.sequence, record.command);
        self.send(record)
            .await
            .map_err(|e| SourceError::Delivery(format!("record channel closed: {}", e)))
    }
}
