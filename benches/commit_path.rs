//! Commit path microbenchmarks
//!
//! Run with: cargo bench --bench commit_path

use criterion::{
  black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use kitefs::db::{Database, DatabaseMeta};
use kitefs::lease::FixedLeaser;
use kitefs::ltx::{LtxEntry, LtxFlags, PageFrame};
use kitefs::{Store, StoreOptions};

const PAGE_SIZE: u32 = 4096;

fn meta() -> DatabaseMeta {
  DatabaseMeta {
    id: 1,
    name: "bench.db".to_string(),
    page_size: PAGE_SIZE,
  }
}

fn page(seed: usize) -> Vec<u8> {
  (0..PAGE_SIZE as usize)
    .map(|i| (i.wrapping_mul(31) ^ seed) as u8)
    .collect()
}

fn commit_pages(db: &Database, first: u32, count: u32, seed: usize) {
  db.begin_write().expect("expected value");
  for pgno in first..first + count {
    db.write_page(pgno, &page(seed + pgno as usize))
      .expect("expected value");
  }
  db.commit().expect("expected value");
}

fn bench_local_commit(c: &mut Criterion) {
  let mut group = c.benchmark_group("local_commit");
  group.sample_size(10);

  for &pages in [1u32, 8, 64].iter() {
    let commits = 50usize;
    group.throughput(Throughput::Elements(commits as u64));
    group.bench_with_input(BenchmarkId::new("pages", pages), &pages, |bencher, &pages| {
      bencher.iter_batched(
        || {
          let temp_dir = tempdir().expect("expected value");
          let db = Database::create(temp_dir.path().join("db"), meta()).expect("expected value");
          (temp_dir, db)
        },
        |(_temp_dir, db)| {
          for i in 0..commits {
            commit_pages(&db, 1, pages, i);
          }
          black_box(db.txid());
        },
        BatchSize::SmallInput,
      );
    });
  }

  group.finish();
}

fn bench_ltx_codec(c: &mut Criterion) {
  let mut group = c.benchmark_group("ltx_codec");
  group.sample_size(20);

  let entry = LtxEntry {
    flags: LtxFlags::empty(),
    page_size: PAGE_SIZE,
    commit: 64,
    txid: 7,
    pre_checksum: 1,
    post_checksum: 2,
    timestamp_ms: 0,
    pages: (1..=64)
      .map(|pgno| PageFrame {
        pgno,
        data: page(pgno as usize),
      })
      .collect(),
  };
  group.throughput(Throughput::Bytes(u64::from(PAGE_SIZE) * 64));

  let plain = entry.encode().expect("expected value");
  group.bench_function("encode", |bencher| {
    bencher.iter(|| black_box(entry.encode().expect("expected value")))
  });
  group.bench_function("decode", |bencher| {
    bencher.iter(|| black_box(LtxEntry::decode(&plain).expect("expected value")))
  });

  let compressed = entry.clone().compressed();
  group.bench_function("encode_compressed", |bencher| {
    bencher.iter(|| black_box(compressed.encode().expect("expected value")))
  });

  group.finish();
}

fn bench_replicated_commit(c: &mut Criterion) {
  let mut group = c.benchmark_group("replicated_commit");
  group.sample_size(10);
  let commits = 20u64;
  group.throughput(Throughput::Elements(commits));

  let temp_dir = tempdir().expect("expected value");
  let primary = Store::open(
    StoreOptions::new(temp_dir.path().join("primary")).retry_interval(Duration::from_millis(10)),
    Arc::new(FixedLeaser::configured("http://primary", true)),
  )
  .expect("expected value");
  wait_for(|| primary.is_primary());
  let primary_url = format!("http://{}", primary.local_addr());
  let replica = Store::open(
    StoreOptions::new(temp_dir.path().join("replica")).retry_interval(Duration::from_millis(10)),
    Arc::new(FixedLeaser::configured(primary_url, false)),
  )
  .expect("expected value");

  let db = primary.create_db("bench.db").expect("expected value");
  wait_for(|| replica.db(db.id()).is_some());

  group.bench_function("commit_and_wait", |bencher| {
    bencher.iter(|| {
      for i in 0..commits {
        primary.begin_write(db.id()).expect("expected value");
        primary
          .write_page(db.id(), 1, &page(i as usize))
          .expect("expected value");
        let txid = primary.commit(db.id()).expect("expected value");
        assert!(replica
          .wait_for_txid(db.id(), txid, Duration::from_secs(10))
          .expect("expected value"));
      }
    })
  });

  group.finish();
}

fn wait_for(mut condition: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(10);
  while !condition() {
    assert!(Instant::now() < deadline, "condition not reached");
    thread::sleep(Duration::from_millis(5));
  }
}

criterion_group!(
  benches,
  bench_local_commit,
  bench_ltx_codec,
  bench_replicated_commit
);
criterion_main!(benches);
