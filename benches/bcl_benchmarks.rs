use bcl_core::eval::{eval, EvalContext};
use bcl_core::pos::Pos;
use bcl_core::{format, parse_config, parse_expression, scanner};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

// ============================================================================
// Test Data: Varying Complexity and Size
// ============================================================================

const TINY_BCL: &str = "value = 42\n";

const SMALL_BCL: &str = r#"name = "test"
version = 1
enabled = true
tags = ["a", "b", "c"]
"#;

const MEDIUM_BCL: &str = r#"defaults = {
  ssl     = true
  retries = 5
  timeout = 30
}

server "web1" {
  host = "server1.example.com"
  port = 8080
  tags = [for t in ["a", "b"] : "web-${t}"]
}

server "web2" {
  host = "server2.example.com"
  port = 8081
  banner = <<-EOT
    Welcome to ${"web2"}
    All systems nominal.
  EOT
}

summary = {
  hosts = ["server1", "server2"]
  live  = true ? "yes" : "no"
}
"#;

// Generate a very large configuration for stress testing.
fn generate_xlarge_bcl(block_count: usize) -> String {
    let mut src = String::new();
    for i in 0..block_count {
        src.push_str(&format!(
            "item \"i{i}\" {{\n  id = {i}\n  name = \"Item ${{upper}}\"\n  value = {}\n  active = {}\n}}\n",
            i * 100,
            i % 2 == 0
        ));
    }
    src
}

// ============================================================================
// Scanner Benchmarks
// ============================================================================

fn bench_scanner_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("scanner_by_size");
    for (name, source) in [
        ("tiny", TINY_BCL),
        ("small", SMALL_BCL),
        ("medium", MEDIUM_BCL),
    ] {
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, src| {
            b.iter(|| scanner::scan(black_box(src), "bench.bcl", Pos::start()));
        });
    }
    group.finish();
}

// ============================================================================
// Parser Benchmarks
// ============================================================================

fn bench_parser_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser_by_size");
    for (name, source) in [
        ("tiny", TINY_BCL),
        ("small", SMALL_BCL),
        ("medium", MEDIUM_BCL),
    ] {
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, src| {
            b.iter(|| parse_config(black_box(src), "bench.bcl"));
        });
    }
    group.finish();
}

fn bench_parser_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser_scaling");
    for size in [10usize, 100, 1000] {
        let source = generate_xlarge_bcl(size);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, src| {
            b.iter(|| parse_config(black_box(src), "bench.bcl"));
        });
    }
    group.finish();
}

// ============================================================================
// Evaluation and Format Benchmarks
// ============================================================================

fn bench_eval_expression(c: &mut Criterion) {
    let ctx = EvalContext::new();
    let (expr, _) = parse_expression(
        "[for i in [1, 2, 3, 4, 5] : \"${i * 100}\" if i % 2 == 1]",
        "bench.bcl",
    );
    c.bench_function("eval_comprehension", |b| {
        b.iter(|| eval(black_box(&expr), &ctx));
    });
}

fn bench_roundtrip(c: &mut Criterion) {
    c.bench_function("cst_roundtrip_medium", |b| {
        b.iter(|| {
            let (file, _) = parse_config(black_box(MEDIUM_BCL), "bench.bcl");
            file.to_source()
        })
    });
}

fn bench_format(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_by_size");
    for size in [10usize, 100] {
        let source = generate_xlarge_bcl(size);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, src| {
            b.iter(|| format(black_box(src), "bench.bcl"));
        });
    }
    group.finish();
}

criterion_group!(scanner_benches, bench_scanner_sizes);
criterion_group!(parser_benches, bench_parser_sizes, bench_parser_scaling);
criterion_group!(
    eval_benches,
    bench_eval_expression,
    bench_roundtrip,
    bench_format
);

criterion_main!(scanner_benches, parser_benches, eval_benches);
