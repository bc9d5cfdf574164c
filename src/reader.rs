//! Per-generation task that forwards command output downstream
use std::sync::Arc;

use log::{debug, trace};
use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::process::{LineDecoder, ProcessError};
use crate::record::{Record, RecordMetadata};
use crate::sink::RecordSink;

/// Why a reader loop ended
#[derive(Debug)]
pub enum ReaderExit {
    /// The command closed its output
    EndOfStream {
        /// Lines delivered during the generation
        lines: u64,
    },
    /// Reading, decoding or delivering failed
    Failed(ProcessError),
    /// The stop signal was observed
    Stopped,
}

/// Resolves once a stop has been requested
///
/// A dropped sender counts as a stop request.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Reads lines from one output stream and hands them to the sink
pub struct ReaderLoop<R> {
    decoder: LineDecoder<R>,
    sink: Arc<dyn RecordSink>,
    metadata: Arc<RecordMetadata>,
    stop: watch::Receiver<bool>,
}

impl<R> ReaderLoop<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Create a reader over `output`
    pub fn new(
        output: R,
        sink: Arc<dyn RecordSink>,
        metadata: Arc<RecordMetadata>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            decoder: LineDecoder::new(output),
            sink,
            metadata,
            stop,
        }
    }

    /// Run the loop on its own task
    ///
    /// The exit cause arrives on the returned receiver exactly once; the
    /// join handle is for the supervisor to join the task afterwards.
    pub fn spawn(self) -> (JoinHandle<()>, oneshot::Receiver<ReaderExit>) {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let exit = self.run().await;
            // Receiver gone means the supervisor is gone too
            let _ = tx.send(exit);
        });
        (task, rx)
    }

    /// Forward lines until end of stream, failure or stop
    pub async fn run(mut self) -> ReaderExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => {
                    debug!("Reader for '{}' stopping on request", self.metadata.command);
                    return ReaderExit::Stopped;
                }
                next = self.decoder.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    trace!("[{}] stdout: {}", self.metadata.command, line.text);
                    let record = Record::new(line, &self.metadata);
                    // A delivery that can complete does; a stalled one yields to stop
                    let delivered = tokio::select! {
                        biased;
                        result = self.sink.accept(record) => Some(result),
                        _ = stop_requested(&mut self.stop) => None,
                    };

                    match delivered {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            return ReaderExit::Failed(ProcessError::Delivery(e.to_string()));
                        }
                        None => {
                            debug!(
                                "Reader for '{}' dropped a pending record on stop",
                                self.metadata.command
                            );
                            return ReaderExit::Stopped;
                        }
                    }
                }
                Ok(None) => {
                    return ReaderExit::EndOfStream {
                        lines: self.decoder.lines_read(),
                    };
                }
                Err(e) => return ReaderExit::Failed(e),
            }
        }
    }
}
