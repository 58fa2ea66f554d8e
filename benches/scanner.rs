//! Parsing Benchmark for flashhttp
//!
//! This benchmark measures the header scanner and request parser
//! over representative request shapes.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashhttp::protocol::{has_header_value, HeaderScanner, RequestHeader};

/// A minimal browser-style GET request
const SMALL_REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\n\
Host: example.com\r\n\
Accept: */*\r\n\
\r\n";

/// A realistic browser request with a dozen headers
const MEDIUM_REQUEST: &[u8] = b"GET /static/app/main.css?v=3 HTTP/1.1\r\n\
Host: www.example.com\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/130.0\r\n\
Accept: text/css,*/*;q=0.1\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: gzip, deflate, br\r\n\
Referer: https://www.example.com/\r\n\
Connection: keep-alive\r\n\
Cookie: session=abcdef0123456789; theme=dark; consent=1\r\n\
Cache-Control: max-age=0\r\n\
If-Modified-Since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
Sec-Fetch-Dest: style\r\n\
Sec-Fetch-Mode: no-cors\r\n\
\r\n";

/// Builds a header block with `n` synthetic headers
fn large_request(n: usize) -> Vec<u8> {
    let mut buf = Vec::from(&b"GET /api/v1/items HTTP/1.1\r\nHost: example.com\r\n"[..]);
    for i in 0..n {
        buf.extend_from_slice(format!("X-Custom-Header-{}: value-{}\r\n", i, i).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Scans every header in `buf`, returning the header count
fn scan_all(buf: &[u8]) -> usize {
    // Skip the request line; the scanner only handles header lines
    let start = buf.iter().position(|&b| b == b'\n').map_or(0, |p| p + 1);
    let mut scanner = HeaderScanner::new(&buf[start..]);
    let mut count = 0;
    while scanner.next() {
        black_box(scanner.key());
        black_box(scanner.value());
        count += 1;
    }
    count
}

/// Benchmark the raw header scanner
fn bench_scanner(c: &mut Criterion) {
    let large = large_request(64);

    let mut group = c.benchmark_group("scanner");

    group.throughput(Throughput::Bytes(SMALL_REQUEST.len() as u64));
    group.bench_function("scan_small", |b| {
        b.iter(|| black_box(scan_all(black_box(SMALL_REQUEST))));
    });

    group.throughput(Throughput::Bytes(MEDIUM_REQUEST.len() as u64));
    group.bench_function("scan_medium", |b| {
        b.iter(|| black_box(scan_all(black_box(MEDIUM_REQUEST))));
    });

    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("scan_64_headers", |b| {
        b.iter(|| black_box(scan_all(black_box(&large))));
    });

    group.finish();
}

/// Benchmark full request-head parsing
fn bench_parse(c: &mut Criterion) {
    let small = Bytes::from_static(SMALL_REQUEST);
    let medium = Bytes::from_static(MEDIUM_REQUEST);
    let large = Bytes::from(large_request(64));

    let mut group = c.benchmark_group("parse");

    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("parse_small", |b| {
        b.iter(|| black_box(RequestHeader::parse(black_box(&small)).unwrap()));
    });

    group.throughput(Throughput::Bytes(medium.len() as u64));
    group.bench_function("parse_medium", |b| {
        b.iter(|| black_box(RequestHeader::parse(black_box(&medium)).unwrap()));
    });

    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("parse_64_headers", |b| {
        b.iter(|| black_box(RequestHeader::parse(black_box(&large)).unwrap()));
    });

    group.finish();
}

/// Benchmark comma-list token matching on Connection-style values
fn bench_header_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_value");
    group.throughput(Throughput::Elements(1));

    group.bench_function("match_first", |b| {
        b.iter(|| black_box(has_header_value(black_box(b"close, te"), b"close")));
    });

    group.bench_function("match_last", |b| {
        b.iter(|| {
            black_box(has_header_value(
                black_box(b"te, trailers, keep-alive"),
                b"keep-alive",
            ))
        });
    });

    group.bench_function("no_match", |b| {
        b.iter(|| {
            black_box(has_header_value(
                black_box(b"te, trailers, keep-alive"),
                b"close",
            ))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_scanner, bench_parse, bench_header_value);

criterion_main!(benches);
