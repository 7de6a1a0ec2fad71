//! Generic pull loop shared by all consumers.
//!
//! A consumer variant only supplies an [`EventHandler`]: its topic, a
//! validator and a persist operation. [`ConsumerLoop`] owns the message
//! source and the store, processes one message at a time and releases both
//! when it stops.

use crate::fields::ValidationError;
use crate::store::{EventStore, StoreError};
use async_trait::async_trait;
use blinkwatch_pipeline::{ConsumerError, IncomingMessage, MessageMetadata, TopicConsumer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ConsumerLoopError {
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),
}

/// Where messages come from
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> Result<IncomingMessage, ConsumerError>;

    /// Mark `metadata` as processed
    fn commit(&mut self, metadata: &MessageMetadata) -> Result<(), ConsumerError>;

    fn close(&mut self) -> Result<(), ConsumerError>;
}

#[async_trait]
impl MessageSource for TopicConsumer {
    async fn next_message(&mut self) -> Result<IncomingMessage, ConsumerError> {
        self.recv().await
    }

    fn commit(&mut self, metadata: &MessageMetadata) -> Result<(), ConsumerError> {
        TopicConsumer::commit(self, metadata)
    }

    fn close(&mut self) -> Result<(), ConsumerError> {
        TopicConsumer::close(self)
    }
}

/// One consumer variant
#[async_trait]
pub trait EventHandler: Send {
    type Event: Send;

    /// Short name used in logs and metric labels
    fn name(&self) -> &'static str;

    fn topic(&self) -> &str;

    fn validate(&self, message: &IncomingMessage) -> Result<Self::Event, ValidationError>;

    async fn persist(
        &mut self,
        event: Self::Event,
        store: &mut dyn EventStore,
    ) -> Result<(), StoreError>;
}

/// Outcome counts for one run of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub persisted: u64,
    pub invalid: u64,
    pub failed: u64,
}

pub struct ConsumerLoop<S, H, St> {
    source: S,
    handler: H,
    store: St,
    stats: LoopStats,
}

impl<S, H, St> ConsumerLoop<S, H, St>
where
    S: MessageSource,
    H: EventHandler,
    St: EventStore,
{
    pub fn new(source: S, handler: H, store: St) -> Self {
        Self {
            source,
            handler,
            store,
            stats: LoopStats::default(),
        }
    }

    /// Pull and process messages until `shutdown` fires or the store fails
    /// fatally, then close the source and the store in that order.
    ///
    /// A message that is already being processed is always finished first.
    #[instrument(skip_all, fields(consumer = self.handler.name()))]
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
    ) -> Result<LoopStats, ConsumerLoopError> {
        info!(topic = %self.handler.topic(), "Starting consumer loop");

        let outcome = self.pull(&shutdown).await;
        self.release().await;

        info!(
            persisted = self.stats.persisted,
            invalid = self.stats.invalid,
            failed = self.stats.failed,
            "Consumer loop stopped"
        );
        outcome.map(|()| self.stats)
    }

    async fn pull(&mut self, shutdown: &CancellationToken) -> Result<(), ConsumerLoopError> {
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                received = self.source.next_message() => Some(received),
            };

            match received {
                None => {
                    info!("Stop requested");
                    return Ok(());
                }
                Some(Ok(message)) => self.process(message).await?,
                Some(Err(e)) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("consumer.kafka.errors", "consumer" => self.handler.name())
                        .increment(1);
                }
            }
        }
    }

    async fn process(&mut self, message: IncomingMessage) -> Result<(), ConsumerLoopError> {
        let name = self.handler.name();
        let metadata = &message.metadata;

        match self.handler.validate(&message) {
            Err(e) => {
                warn!(
                    error = %e,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    "Dropping invalid message"
                );
                metrics::counter!("consumer.messages.invalid", "consumer" => name).increment(1);
                self.stats.invalid += 1;
            }
            Ok(event) => match self.handler.persist(event, &mut self.store).await {
                Ok(()) => {
                    debug!(partition = metadata.partition, offset = metadata.offset, "Persisted");
                    metrics::counter!("consumer.messages.persisted", "consumer" => name)
                        .increment(1);
                    self.stats.persisted += 1;
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        error = %e,
                        partition = metadata.partition,
                        offset = metadata.offset,
                        "Store unavailable, stopping consumer"
                    );
                    metrics::counter!("consumer.messages.failed", "consumer" => name).increment(1);
                    self.stats.failed += 1;
                    return Err(e.into());
                }
                Err(e) => {
                    error!(
                        error = %e,
                        partition = metadata.partition,
                        offset = metadata.offset,
                        "Failed to persist message, skipping"
                    );
                    metrics::counter!("consumer.messages.failed", "consumer" => name).increment(1);
                    self.stats.failed += 1;
                }
            },
        }

        if let Err(e) = self.source.commit(metadata) {
            warn!(error = %e, offset = metadata.offset, "Failed to commit offset");
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Err(e) = self.source.close() {
            error!(error = %e, "Failed to close broker subscription");
        }
        if let Err(e) = self.store.close().await {
            error!(error = %e, "Failed to close store connection");
        }
    }
}
