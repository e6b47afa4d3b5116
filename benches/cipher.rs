//! Performance benchmarks for aegis-core
//!
//! Run with: cargo bench

use aegis_core::{AuditEvent, AuditLog, KeyVault, MemoryStore, TenantCipher};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn bench_searchable_hash(c: &mut Criterion) {
    let cipher = TenantCipher::new(Arc::new(KeyVault::new()));

    c.bench_function("searchable_hash", |b| {
        b.iter(|| cipher.searchable_hash("jane.doe@example.com", "tenant-1"));
    });
}

fn bench_encrypt(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cipher = Arc::new(TenantCipher::new(Arc::new(KeyVault::new())));

    // Bootstrap the tenant key outside the measured loop
    rt.block_on(async { cipher.encrypt(b"warmup", "tenant-1").await.unwrap() });

    let mut group = c.benchmark_group("encrypt");
    for size in [64usize, 1024, 16 * 1024] {
        let plaintext = vec![0xaau8; size];
        group.bench_function(format!("{} bytes", size), |b| {
            let cipher = cipher.clone();
            let plaintext = plaintext.clone();
            b.to_async(&rt)
                .iter(|| async { cipher.encrypt(&plaintext, "tenant-1").await.unwrap() });
        });
    }
    group.finish();
}

fn bench_decrypt(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cipher = Arc::new(TenantCipher::new(Arc::new(KeyVault::new())));

    let record = rt.block_on(async {
        cipher
            .encrypt(&vec![0xaau8; 1024], "tenant-1")
            .await
            .unwrap()
    });

    c.bench_function("decrypt (1 KiB)", |b| {
        b.to_async(&rt)
            .iter(|| async { cipher.decrypt(&record, "tenant-1").await.unwrap() });
    });
}

fn bench_audit_log_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let audit = Arc::new(AuditLog::new(Arc::new(MemoryStore::new())));

    c.bench_function("AuditLog log_event", |b| {
        let audit = audit.clone();
        b.to_async(&rt).iter(|| {
            let audit = audit.clone();
            async move {
                audit
                    .log_event(
                        AuditEvent::new("tenant-1", "user-1", "read", "case")
                            .with_ip("198.51.100.7"),
                    )
                    .await
            }
        });
    });
}

criterion_group!(
    benches,
    bench_searchable_hash,
    bench_encrypt,
    bench_decrypt,
    bench_audit_log_event,
);
criterion_main!(benches);
