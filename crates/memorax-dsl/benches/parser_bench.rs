use criterion::{criterion_group, criterion_main, Criterion};

fn dekker_like(processes: usize) -> String {
    let mut src = String::from("forbidden");
    for _ in 0..processes {
        src.push_str(" CS");
    }
    src.push_str("\ndata\n");
    for p in 0..processes {
        src.push_str(&format!("  flag{p} = 0 : [0:1]\n"));
    }
    for p in 0..processes {
        src.push_str(&format!(
            "process\ntext\n  L0: write: flag{p} := 1;\n  L1: read: flag{} = 0;\n  CS: nop;\n  goto L0\n",
            (p + 1) % processes
        ));
    }
    src
}

fn bench_parse(c: &mut Criterion) {
    let small = dekker_like(2);
    let large = dekker_like(16);
    c.bench_function("parse_dekker_2", |b| {
        b.iter(|| memorax_dsl::parse(&small, "bench.rmm").unwrap())
    });
    c.bench_function("parse_dekker_16", |b| {
        b.iter(|| memorax_dsl::parse(&large, "bench.rmm").unwrap())
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
