//! Graph subscriber wiring: backends, command gateway, cascades and the worker pool.
//!
//! Backends are picked from [`SubscriberConfig`]: Postgres when a database URL is set,
//! Redis Streams when a Redis URL is set (behind the `redis` feature), in-memory otherwise.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::{info, warn};

use custos_events::{EventPublisher, InMemorySubscriptionHub, SubscriptionSource};
use custos_infra::cascade::{CascadeOrchestrator, CommandGateway, DispatchingGateway};
use custos_infra::command_dispatcher::CommandDispatcher;
use custos_infra::config::SubscriberConfig;
use custos_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore, PublishingEventStore};
use custos_infra::projections::projection_router;
use custos_infra::read_model::{InMemoryReadModel, PostgresReadModel, ReadModelStore};
use custos_infra::workers::{PoolHandle, SubscriptionPool};

/// A running subscriber.
pub struct Subscriber {
    pub pool: PoolHandle,
    pub read_model: Arc<dyn ReadModelStore>,
    /// Same gateway the cascades use; commands sent here reach the pool through the broker.
    pub commands: Arc<dyn CommandGateway>,
}

/// Connect the configured backends and start the worker pool.
///
/// Must be called inside a Tokio runtime; the Postgres backends block on it from the
/// worker threads.
pub async fn start(config: &SubscriberConfig) -> anyhow::Result<Subscriber> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url).await.context("failed to connect to Postgres")?;
            let events = PostgresEventStore::new(pool.clone(), Handle::current());
            events.migrate().await.context("event store migration failed")?;
            let read_model = PostgresReadModel::new(pool, Handle::current());
            read_model.migrate().await.context("read model migration failed")?;
            info!("using Postgres event store and read model");
            with_broker(config, events, Arc::new(read_model))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory event store and read model");
            with_broker(config, InMemoryEventStore::new(), Arc::new(InMemoryReadModel::new()))
        }
    }
}

fn with_broker<E>(
    config: &SubscriberConfig,
    events: E,
    read_model: Arc<dyn ReadModelStore>,
) -> anyhow::Result<Subscriber>
where
    E: EventStore + 'static,
{
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let streams = custos_infra::event_bus::RedisStreams::new(url, config.stream_key.clone())
            .context("invalid Redis URL")?
            .with_partitions(config.subscription.pool_size)
            .with_buffer_size(config.subscription.buffer_size)
            .with_max_redeliveries(config.subscription.max_redeliveries);
        info!(stream = %config.stream_key, partitions = streams.partitions(), "using Redis Streams broker");
        return assemble(config, events, streams.clone(), Arc::new(streams), read_model);
    }

    #[cfg(not(feature = "redis"))]
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but the redis feature is not enabled; using the in-memory hub");
    }

    let hub = InMemorySubscriptionHub::new(config.subscription.max_redeliveries);
    assemble(config, events, hub.clone(), Arc::new(hub), read_model)
}

fn assemble<E, P>(
    config: &SubscriberConfig,
    events: E,
    publisher: P,
    source: Arc<dyn SubscriptionSource>,
    read_model: Arc<dyn ReadModelStore>,
) -> anyhow::Result<Subscriber>
where
    E: EventStore + 'static,
    P: EventPublisher + 'static,
{
    let dispatcher = CommandDispatcher::new(PublishingEventStore::new(events, publisher)).with_config(config.dispatch);
    let commands: Arc<dyn CommandGateway> = Arc::new(DispatchingGateway::new(dispatcher));
    let cascade = Arc::new(CascadeOrchestrator::new(read_model.clone(), commands.clone()));
    let router = projection_router(read_model.clone(), cascade);

    let pool = SubscriptionPool::start(source, Arc::new(router), &config.subscription)
        .context("failed to start the subscription pool")?;

    Ok(Subscriber {
        pool,
        read_model,
        commands,
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use custos_core::{EntityId, ExternalSystem, SourceFields, TenantId};
    use custos_events::BaseCommand;
    use custos_infra::cascade::OutboundCommand;
    use custos_infra::read_model::{OrganizationView, labels, queries};
    use custos_organization::{CreateOrganization, OrganizationCommand, OrganizationFields};

    use super::*;

    fn in_memory_config() -> SubscriberConfig {
        let mut config = SubscriberConfig::default();
        config.subscription = config
            .subscription
            .with_pool_size(2)
            .with_receive_timeout(Duration::from_millis(20));
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_memory_subscriber_projects_commands() {
        let subscriber = start(&in_memory_config()).await.unwrap();
        let tenant = TenantId::new("acme");
        let id = EntityId::new();

        subscriber
            .commands
            .send(OutboundCommand::Organization(OrganizationCommand::Create(CreateOrganization {
                base: BaseCommand::new(tenant.clone(), id, "test"),
                fields: OrganizationFields {
                    name: "Acme".into(),
                    ..Default::default()
                },
                source: SourceFields::openline("test"),
                external_system: ExternalSystem::default(),
            })))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let view = loop {
            let loaded =
                queries::load::<OrganizationView>(subscriber.read_model.as_ref(), &tenant, labels::ORGANIZATION, id)
                    .unwrap();
            if let Some(loaded) = loaded {
                break loaded.view;
            }
            assert!(Instant::now() < deadline, "organization was never projected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(view.name, "Acme");

        let pool = subscriber.pool;
        tokio::task::spawn_blocking(move || pool.shutdown()).await.unwrap().unwrap();
    }
}
