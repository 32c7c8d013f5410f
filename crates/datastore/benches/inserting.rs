use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use dorm_datastore::{Criteria, Record, Registry, Schema, SchemaBuilder, SqliteStorage, Value};

fn build_schema() -> Arc<Schema> {
    let mut builder = SchemaBuilder::new("s".into());
    builder
        .add_table("t".into(), |tb| {
            tb.add_number_column("primary_key".into())?;
            tb.add_string_column("string_col".into())?;
            tb.add_nullable_number_column("number_col".into())?;
            tb.set_primary_key(["primary_key"]);
            Ok(())
        })
        .unwrap();
    Registry::new().define(builder.build().unwrap()).unwrap()
}

fn open(path: &std::path::Path) -> SqliteStorage {
    let mut db = SqliteStorage::open(path.join("bench.sqlite")).unwrap();
    db.execute_batch(
        "CREATE TABLE t (primary_key INTEGER PRIMARY KEY, string_col TEXT NOT NULL, number_col INTEGER)",
    )
    .unwrap();
    db
}

fn build_test_rows(row_count: usize) -> Vec<Vec<Value>> {
    (0..row_count)
        .map(|i| {
            vec![
                Value::from(i as i64),
                Value::from(format!("string{}", i)),
                Value::from(i as i64 * 2),
            ]
        })
        .collect()
}

pub fn benchmarks(c: &mut Criterion) {
    let schema = build_schema();
    let columns = ["primary_key", "string_col", "number_col"];

    let mut group = c.benchmark_group("inserting");
    for size in [5, 10, 20, 50, 100, 500] {
        group.throughput(Throughput::Elements(size));
        let rows = build_test_rows(size as usize);
        let records = rows
            .iter()
            .map(|r| columns.iter().copied().zip(r.iter().cloned()).collect::<Record>())
            .collect::<Vec<_>>();

        group.bench_with_input(BenchmarkId::new("create_only", size), &size, |b, _| {
            let tdir = tempfile::TempDir::new().expect("Should create");
            let mut db = open(tdir.path());
            let t = schema.table("t").unwrap();

            b.iter(|| {
                t.create_only(&mut db, &records[..]).unwrap();
                t.delete(&mut db, &Criteria::new()).unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("bulk_create", size), &size, |b, _| {
            let tdir = tempfile::TempDir::new().expect("Should create");
            let mut db = open(tdir.path());
            let t = schema.table("t").unwrap();

            b.iter(|| {
                t.bulk_create(&mut db, &columns, &rows[..]).unwrap();
                t.delete(&mut db, &Criteria::new()).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
