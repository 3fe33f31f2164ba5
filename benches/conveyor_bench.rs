//! Benchmarks for conveyor throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

use beltline::executor::{NodeRole, WorkerMode};
use beltline::testing::{CollectingSink, NumberSource, SquareOperator};
use beltline::Conveyor;

fn linear_conveyor_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("linear_loop_1000_items", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut cnv = Conveyor::new("bench", 100);
                cnv.add_node_executor(
                    Arc::new(NumberSource::new("gen", 999)),
                    WorkerMode::Loop,
                    NodeRole::Source,
                )
                .unwrap();
                cnv.add_node_executor(
                    Arc::new(SquareOperator::new("sqr")),
                    WorkerMode::Loop,
                    NodeRole::Operator,
                )
                .unwrap();
                cnv.add_node_executor(
                    Arc::new(CollectingSink::new("sink")),
                    WorkerMode::Loop,
                    NodeRole::Sink,
                )
                .unwrap();

                tokio::time::timeout(Duration::from_secs(10), cnv.start())
                    .await
                    .unwrap()
                    .unwrap();
            });
        });
    });
}

criterion_group!(benches, linear_conveyor_benchmark);
criterion_main!(benches);
