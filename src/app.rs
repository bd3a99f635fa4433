//! Wiring: stores, publisher and worker built from one [`Config`].

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{BrokerKind, Config};
use crate::db;
use crate::migrate::apply_schema;
use crate::queue::amqp::{AmqpConsumer, AmqpPublisher};
use crate::queue::local::{self, LocalConsumer};
use crate::queue::{MessageHandler, MessagePublisher};
use crate::service::JobService;
use crate::store::{CatalogStore, JobStore, SqliteStore};

pub struct App {
    config: Config,
    store: Arc<SqliteStore>,
    publisher: Arc<dyn MessagePublisher>,
    local_consumer: Option<LocalConsumer>,
    opened_at: DateTime<Utc>,
}

impl App {
    /// Opens the database (creating the schema if needed) and the publisher.
    pub async fn open(config: Config) -> Result<Self> {
        let opened_at = Utc::now();
        let pool = db::connect(&config).await?;
        apply_schema(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));

        let (publisher, local_consumer) = match config.broker.kind {
            BrokerKind::Amqp => {
                let publisher = AmqpPublisher::new(config.broker.clone());
                publisher.warm_up().await;
                let publisher: Arc<dyn MessagePublisher> = Arc::new(publisher);
                (publisher, None)
            }
            BrokerKind::Local => {
                let (publisher, consumer) = local::channel();
                let publisher: Arc<dyn MessagePublisher> = Arc::new(publisher);
                (publisher, Some(consumer))
            }
        };

        Ok(Self {
            config,
            store,
            publisher,
            local_consumer,
            opened_at,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn jobs(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn catalog(&self) -> Arc<dyn CatalogStore> {
        self.store.clone()
    }

    pub fn service(&self) -> JobService {
        JobService::new(self.jobs(), self.publisher.clone())
    }

    /// Starts the queue consumer task. With the local broker this can only
    /// happen once per process, and jobs still queued from an earlier process
    /// are failed first since their messages are gone.
    pub async fn spawn_worker(&mut self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let handler = Arc::new(MessageHandler::new(
            self.jobs(),
            self.catalog(),
            self.config.processing.clone(),
        ));

        let task = match self.config.broker.kind {
            BrokerKind::Amqp => {
                let consumer = AmqpConsumer::new(self.config.broker.clone(), handler);
                tokio::spawn(consumer.run(cancel))
            }
            BrokerKind::Local => {
                let Some(consumer) = self.local_consumer.take() else {
                    bail!("local queue consumer already started");
                };
                local::fail_orphaned_jobs(self.store.as_ref(), self.opened_at).await?;
                tokio::spawn(consumer.run(handler, cancel))
            }
        };
        Ok(task)
    }

    pub async fn close(self) {
        self.store.pool().close().await;
    }
}
