use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use custos_core::{EntityId, ExternalSystem, FieldMask, SourceFields, StreamId, TenantId};
use custos_events::{BaseCommand, RecordedEvent};
use custos_infra::command_dispatcher::{CommandDispatcher, rehydrate};
use custos_infra::event_store::{EventStore, InMemoryEventStore};
use custos_infra::projections::{EventHandler, OrganizationProjector};
use custos_infra::read_model::{EntityMerge, InMemoryReadModel, ReadModelStore, labels};
use custos_organization::{
    CreateOrganization, Organization, OrganizationCommand, OrganizationField, OrganizationFields, UpdateOrganization,
};
use serde_json::json;
use std::sync::Arc;

fn tenant() -> TenantId {
    TenantId::new("bench")
}

fn create(id: EntityId) -> OrganizationCommand {
    OrganizationCommand::Create(CreateOrganization {
        base: BaseCommand::new(tenant(), id, "bench"),
        fields: OrganizationFields {
            name: "Acme".to_string(),
            website: "acme.io".to_string(),
            ..Default::default()
        },
        source: SourceFields::openline("bench"),
        external_system: ExternalSystem::default(),
    })
}

fn rename(id: EntityId, i: usize) -> OrganizationCommand {
    OrganizationCommand::Update(UpdateOrganization {
        base: BaseCommand::new(tenant(), id, "bench"),
        fields: OrganizationFields {
            name: format!("Acme {i}"),
            employees: i as i64,
            ..Default::default()
        },
        mask: FieldMask::only([OrganizationField::Name, OrganizationField::Employees]),
        source: SourceFields::openline("bench"),
        external_system: ExternalSystem::default(),
    })
}

/// One organization stream of `count` events: a create followed by updates.
fn history(count: usize) -> (EntityId, Vec<RecordedEvent>) {
    let store = Arc::new(InMemoryEventStore::new());
    let dispatcher = CommandDispatcher::new(store.clone());
    let id = EntityId::new();

    dispatcher.dispatch(create(id), Organization::empty).unwrap();
    for i in 1..count {
        dispatcher.dispatch(rename(id, i), Organization::empty).unwrap();
    }
    let events = store
        .load_stream(&StreamId::for_entity("organization", &tenant(), &id))
        .unwrap();
    (id, events)
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_execution_latency");

    group.bench_function("create_fresh", |b| {
        let dispatcher = CommandDispatcher::new(Arc::new(InMemoryEventStore::new()));
        b.iter(|| {
            dispatcher
                .dispatch(black_box(create(EntityId::new())), Organization::empty)
                .unwrap();
        });
    });

    // Each iteration replays the whole stream before deciding.
    group.bench_function("update_with_history", |b| {
        let dispatcher = CommandDispatcher::new(Arc::new(InMemoryEventStore::new()));
        let id = EntityId::new();
        dispatcher.dispatch(create(id), Organization::empty).unwrap();
        let mut i = 0;
        b.iter(|| {
            i += 1;
            dispatcher.dispatch(black_box(rename(id, i)), Organization::empty).unwrap();
        });
    });

    group.finish();
}

fn bench_aggregate_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_replay");

    for count in [10usize, 100, 1000] {
        let (id, events) = history(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("rehydrate", count), &events, |b, events| {
            b.iter(|| {
                let mut org = Organization::empty(id);
                rehydrate(&mut org, black_box(events)).unwrap();
                org
            });
        });
    }

    group.finish();
}

fn bench_projection_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild");

    for count in [10usize, 100, 1000] {
        let (_, events) = history(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("organization", count), &events, |b, events| {
            b.iter(|| {
                let projector = OrganizationProjector::new(Arc::new(InMemoryReadModel::new()));
                for event in events {
                    projector.handle(black_box(event)).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_read_model_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_model_merge");
    group.throughput(Throughput::Elements(1));

    group.bench_function("sourced_merge_same_entity", |b| {
        let store = InMemoryReadModel::new();
        let id = EntityId::new();
        let source = SourceFields::openline("bench");
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let merge = EntityMerge::from_source(labels::ORGANIZATION, id, &source)
                .sourced("name", json!("Acme"))
                .sourced("employees", json!(i))
                .always("renewal_forecast_arr", json!(i as f64));
            store.merge(&tenant(), black_box(merge)).unwrap();
        });
    });

    group.bench_function("external_merge_fill_only", |b| {
        let store = InMemoryReadModel::new();
        let id = EntityId::new();
        store
            .merge(
                &tenant(),
                EntityMerge::from_source(labels::ORGANIZATION, id, &SourceFields::openline("bench"))
                    .sourced("name", json!("Acme")),
            )
            .unwrap();
        let external = SourceFields::new("hubspot", "sync");
        b.iter(|| {
            let merge = EntityMerge::from_source(labels::ORGANIZATION, id, &external)
                .sourced("name", json!("Acme Hub"))
                .sourced("industry", json!("Software"));
            store.merge(&tenant(), black_box(merge)).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_aggregate_replay,
    bench_projection_rebuild,
    bench_read_model_merge
);
criterion_main!(benches);
