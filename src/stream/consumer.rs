//! Consumer loop: read batches from the stream, dispatch to the event
//! processor, ack on success, and periodically reclaim stale pending
//! entries. Shutdown is cooperative.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{StreamEntry, StreamTransport};
use crate::ingest::EventProcessor;

/// Consumer tunables with the documented defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Entries per read.
    pub batch_size: usize,
    /// Block interval of an empty read.
    pub block: Duration,
    /// Pending entries idle longer than this may be claimed by another
    /// consumer.
    pub min_idle: Duration,
    /// How often to attempt reclamation.
    pub reclaim_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block: Duration::from_millis(5000),
            min_idle: Duration::from_millis(60_000),
            reclaim_interval: Duration::from_millis(30_000),
        }
    }
}

/// Consumer name: `<host>-<pid>`, so two processes on one host differ.
#[must_use]
pub fn consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
    format!("{host}-{pid}", pid = std::process::id())
}

/// One consumer task over the durable stream.
pub struct Consumer {
    transport: Arc<dyn StreamTransport>,
    processor: Arc<EventProcessor>,
    config: ConsumerConfig,
    name: String,
}

impl Consumer {
    /// Create a consumer with the standard `<host>-<pid>` name.
    #[must_use]
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        processor: Arc<EventProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            transport,
            processor,
            config,
            name: consumer_name(),
        }
    }

    /// Run until the shutdown signal flips. In-flight entries are drained
    /// before returning; unacked entries are left for reclamation.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = %self.name, "Consumer loop started");
        let mut last_reclaim = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reclaim.elapsed() >= self.config.reclaim_interval {
                last_reclaim = Instant::now();
                match self
                    .transport
                    .claim_idle(&self.name, self.config.min_idle, self.config.batch_size)
                    .await
                {
                    Ok(entries) => self.process_entries(entries).await,
                    Err(e) => {
                        tracing::warn!(consumer = %self.name, error = %e, "Idle reclamation failed");
                    }
                }
            }

            let entries = tokio::select! {
                result = self.transport.read_group(&self.name, self.config.batch_size, self.config.block) => {
                    match result {
                        Ok(entries) => entries,
                        Err(e) => {
                            tracing::warn!(consumer = %self.name, error = %e, "Stream read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            };

            self.process_entries(entries).await;
        }

        tracing::info!(consumer = %self.name, "Consumer loop stopped");
    }

    async fn process_entries(&self, entries: Vec<StreamEntry>) {
        for entry in entries {
            let event = match entry.event() {
                Ok(event) => event,
                Err(e) => {
                    // A corrupt payload can never succeed; ack it away so it
                    // does not circulate through reclamation forever.
                    tracing::error!(
                        stream_id = %entry.stream_id,
                        error = %e,
                        "Discarding undecodable stream entry"
                    );
                    self.ack(&entry.stream_id).await;
                    continue;
                }
            };

            match self.processor.process(&event).await {
                Ok(outcome) => {
                    tracing::debug!(
                        stream_id = %entry.stream_id,
                        event_id = %event.id,
                        ?outcome,
                        "Processed stream entry"
                    );
                    self.ack(&entry.stream_id).await;
                }
                Err(e) => {
                    // No ack: the entry stays pending and will be reclaimed.
                    tracing::warn!(
                        stream_id = %entry.stream_id,
                        event_id = %event.id,
                        error = %e,
                        "Event processing failed; leaving entry pending"
                    );
                }
            }
        }
    }

    async fn ack(&self, stream_id: &str) {
        if let Err(e) = self.transport.ack(stream_id).await {
            tracing::warn!(stream_id, error = %e, "Ack failed; entry will be re-delivered");
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_name_includes_pid() {
        let name = consumer_name();
        assert!(name.ends_with(&std::process::id().to_string()));
        assert!(name.contains('-'));
    }

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.block, Duration::from_millis(5000));
        assert_eq!(config.min_idle, Duration::from_millis(60_000));
    }
}
