//! Routing Benchmarks
//!
//! Path search over generated device graphs and request handling on a
//! small simulated machine.

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pf_ball::{
    DeviceConfig, DriverConfig, MachineConfig, NodeId, PlayfieldConfig, Simulator, SwitchConfig,
    TAG_TROUGH, Topology,
};

const GRAPH_SIZES: &[usize] = &[16, 64, 256];

/// Layered graph: node 0 is the playfield, every other node ejects to the
/// two nodes of the layer below it, the bottom layer ejects to the playfield.
fn layered_topology(nodes: usize) -> Topology {
    let mut targets = vec![Vec::new(); nodes];
    for (index, list) in targets.iter_mut().enumerate().skip(1) {
        if index <= 2 {
            list.push(NodeId(0));
        } else {
            list.push(NodeId(index - 2));
            list.push(NodeId(index - 1));
        }
    }
    Topology::new(targets)
}

fn bench_path_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_from_available");

    for &size in GRAPH_SIZES {
        let topology = layered_topology(size);
        let source = NodeId(size - 1);

        group.bench_with_input(BenchmarkId::new("deepest_source", size), &size, |b, _| {
            b.iter(|| black_box(topology.path_from_available(NodeId(0), |n| n == source)))
        });

        group.bench_with_input(BenchmarkId::new("no_source", size), &size, |b, _| {
            b.iter(|| black_box(topology.path_from_available(NodeId(0), |_| false)))
        });
    }

    group.finish();
}

fn bench_nearest(c: &mut Criterion) {
    let topology = layered_topology(256);
    c.bench_function("nearest_playfield_from_top", |b| {
        b.iter(|| black_box(topology.nearest(NodeId(255), |n| n == NodeId(0))))
    });
}

fn chain_machine() -> MachineConfig {
    let trough = ["s_trough_1", "s_trough_2", "s_trough_3"];
    let mut switches: Vec<SwitchConfig> = trough.iter().map(|s| SwitchConfig::new(s)).collect();
    switches.push(SwitchConfig::new("s_plunger"));

    let mut playfield = PlayfieldConfig::new("playfield");
    playfield.ball_search.enabled = false;

    MachineConfig {
        switches,
        drivers: vec![DriverConfig::new("c_trough"), DriverConfig::new("c_plunger")],
        playfields: vec![playfield],
        ball_devices: vec![
            DeviceConfig::new("trough", &trough, "c_trough", &["plunger"]).tagged(TAG_TROUGH),
            DeviceConfig::new("plunger", &["s_plunger"], "c_plunger", &["playfield"]),
        ],
        ..Default::default()
    }
}

fn bench_request_ball(c: &mut Criterion) {
    let config = chain_machine();
    c.bench_function("request_ball_through_chain", |b| {
        b.iter_batched(
            || {
                let mut sim = Simulator::new(config.clone()).unwrap();
                sim.set_initial("s_trough_1", true);
                sim.set_initial("s_trough_2", true);
                sim.start();
                sim
            },
            |mut sim| {
                sim.machine_mut().request_ball("playfield").unwrap();
                black_box(sim.machine().pending_requests())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_path_search, bench_nearest, bench_request_ball);
criterion_main!(benches);
