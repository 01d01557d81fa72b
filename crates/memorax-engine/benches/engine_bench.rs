use criterion::{criterion_group, criterion_main, Criterion};

use memorax_engine::reachability::reachability;
use memorax_engine::sb::SbCommon;
use memorax_engine::vips::{reachability_vips, VipsCommon};
use memorax_machine::Machine;

const LITMUS: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  L1: read: y = 0;
  CS: nop

process
text
  M0: write: y := 1;
  M1: read: x = 0;
  CS: nop
"#;

fn build() -> Machine {
    let program = memorax_dsl::parse(LITMUS, "bench.rmm").unwrap();
    Machine::from_ast(&program, LITMUS, "bench.rmm").unwrap()
}

fn bench_engines(c: &mut Criterion) {
    let machine = build();
    c.bench_function("sb_backward_litmus", |b| {
        b.iter(|| {
            let common = SbCommon::new(machine.clone());
            reachability(&common, common.bad_states())
        })
    });
    c.bench_function("vips_forward_litmus", |b| {
        b.iter(|| {
            let common = VipsCommon::new(machine.clone()).unwrap();
            reachability_vips(&common)
        })
    });
}

criterion_group!(benches, bench_engines);
criterion_main!(benches);
