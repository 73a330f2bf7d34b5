use cncstream_core::{
    AppEvent, EventBus, EventFilter, Expr, MachineEvent, MachineStateBus, Position,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_state_bus(c: &mut Criterion) {
    let bus = MachineStateBus::new();
    c.bench_function("state_bus_status_update", |b| {
        let mut v = 0.0;
        b.iter(|| {
            v += 0.001;
            bus.update(|s| {
                s.machine = Position::new(v, v, v);
                s.work = Position::new(v, v, v);
                s.status_seq += 1;
            });
        })
    });
    c.bench_function("state_bus_snapshot", |b| b.iter(|| black_box(bus.snapshot())));
}

fn bench_expr(c: &mut Criterion) {
    let bus = MachineStateBus::new();
    bus.set("toolprobez", -10.0).ok();
    bus.set("tooldistance", 15.0).ok();
    let expr = Expr::parse("toolprobez-mz-tooldistance").ok();
    c.bench_function("expr_eval_probe_distance", |b| {
        b.iter(|| {
            let state = bus.snapshot();
            black_box(expr.as_ref().map(|e| e.eval(&state)))
        })
    });
}

fn bench_event_bus(c: &mut Criterion) {
    let bus = EventBus::new();
    for _ in 0..8 {
        bus.subscribe(EventFilter::All, |event| {
            black_box(event);
        });
    }
    c.bench_function("event_bus_publish_8_handlers", |b| {
        b.iter(|| bus.publish(AppEvent::Machine(MachineEvent::AlarmCleared)))
    });
}

criterion_group!(benches, bench_state_bus, bench_expr, bench_event_bus);
criterion_main!(benches);
