//! 编组性能基准测试
//!
//! 测试标量、列表/映射逐元素复制和外部方法往返调用的开销

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use slot_bridge::bindings::{read_slot, write_slot, ForeignRegistry, HostValue};
use slot_bridge::config::VmConfig;
use slot_bridge::vm::sandbox::{SandboxVm, ScriptLibrary};
use slot_bridge::vm::Vm;
use std::rc::Rc;

fn bench_scalars(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalars");
    let mut vm = SandboxVm::default();
    vm.ensure_slots(2).unwrap();

    group.bench_function("num", |b| {
        b.iter(|| {
            vm.set_slot_double(1, black_box(42.5)).unwrap();
            black_box(vm.get_slot_double(1).unwrap())
        });
    });

    let text = "x".repeat(256);
    group.bench_function("string_256", |b| {
        b.iter(|| {
            vm.set_slot_string(1, black_box(&text)).unwrap();
            black_box(vm.get_slot_string(1).unwrap())
        });
    });

    let bytes = vec![7u8; 4096];
    group.bench_function("bytes_4k", |b| {
        b.iter(|| {
            vm.set_slot_bytes(1, black_box(&bytes)).unwrap();
            black_box(vm.get_slot_bytes(1).unwrap())
        });
    });

    group.finish();
}

fn bench_composites(c: &mut Criterion) {
    let mut group = c.benchmark_group("composites");

    for size in [8usize, 64, 512] {
        let list = HostValue::List((0..size).map(|i| HostValue::Num(i as f64)).collect());
        let map = HostValue::Map(
            (0..size)
                .map(|i| (HostValue::Text(format!("k{}", i)), HostValue::Bool(i % 2 == 0)))
                .collect(),
        );

        group.bench_with_input(BenchmarkId::new("list", size), &list, |b, list| {
            let mut vm = SandboxVm::default();
            vm.ensure_slots(1).unwrap();
            b.iter(|| {
                write_slot(&mut vm, 0, list).unwrap();
                black_box(read_slot(&mut vm, 0).unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("map", size), &map, |b, map| {
            let mut vm = SandboxVm::default();
            vm.ensure_slots(1).unwrap();
            b.iter(|| {
                write_slot(&mut vm, 0, map).unwrap();
                black_box(read_slot(&mut vm, 0).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_foreign_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("foreign_round_trip");

    let mut registry = ForeignRegistry::new();
    registry
        .register_method("main", "Math", true, "add(_,_)", |vm| {
            let sum = vm.get_slot_double(1)? + vm.get_slot_double(2)?;
            vm.set_slot_double(0, sum)?;
            Ok(())
        })
        .unwrap();
    let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(registry), Rc::new(ScriptLibrary::new()));
    assert!(vm
        .interpret("main", "class Math\nforeign static Math.add(_,_)")
        .is_success());
    let add = vm.make_call_handle("add(_,_)").unwrap();

    group.bench_function("static_add", |b| {
        b.iter(|| {
            vm.ensure_slots(3).unwrap();
            vm.get_variable("main", "Math", 0).unwrap();
            vm.set_slot_double(1, black_box(1.0)).unwrap();
            vm.set_slot_double(2, black_box(2.0)).unwrap();
            assert!(vm.call(&add).is_success());
            black_box(vm.get_slot_double(0).unwrap())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_scalars, bench_composites, bench_foreign_round_trip);
criterion_main!(benches);
