//! Response-Scan Benchmark for SurgePool
//!
//! The response parser runs once per read on the hot path of every
//! request/response peer; this benchmark measures it over the buffer shapes
//! the engine actually sees.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use surgepool::http::{scan_responses, TransferMode};

fn fixed_response(body_len: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(
        format!("HTTP/1.1 200 OK\r\nServer: bench\r\nContent-Length: {body_len}\r\n\r\n")
            .as_bytes(),
    );
    buf.resize(buf.len() + body_len, b'x');
    buf
}

/// Benchmark scanning pipelined fixed-length responses
fn bench_fixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_fixed");

    for &(name, body, count) in &[("small_x16", 32usize, 16usize), ("large_x1", 8192, 1)] {
        let mut buf = Vec::new();
        for _ in 0..count {
            buf.extend_from_slice(&fixed_response(body));
        }
        group.throughput(Throughput::Bytes(buf.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let scan = scan_responses(black_box(&buf), TransferMode::Unknown).unwrap();
                black_box(scan.completed)
            });
        });
    }

    group.finish();
}

/// Benchmark the chunked terminal-marker search
fn bench_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_chunked");

    let mut buf = Vec::new();
    buf.extend_from_slice(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
    buf.extend_from_slice(format!("{:x}\r\n", 8000).as_bytes());
    buf.resize(buf.len() + 8000, b'y');
    buf.extend_from_slice(b"\r\n0\r\n\r\n");

    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("one_8k_chunk", |b| {
        b.iter(|| {
            let scan = scan_responses(black_box(&buf), TransferMode::Unknown).unwrap();
            black_box(scan.completed)
        });
    });

    // Resuming mid-body: the whole buffer is marker search.
    let body = vec![b'z'; 16 * 1024 - 5];
    let mut resume = body.clone();
    resume.extend_from_slice(b"0\r\n\r\n");
    group.throughput(Throughput::Bytes(resume.len() as u64));
    group.bench_function("resume_16k_body", |b| {
        b.iter(|| {
            let scan = scan_responses(black_box(&resume), TransferMode::Chunked).unwrap();
            black_box(scan.completed)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fixed, bench_chunked);
criterion_main!(benches);
