//! Trace capture and replay across a mesh.

mod common;

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tessel_driver::kernels::{counter_program, eltwise_program, random_programs, BinaryOp};
use tessel_driver::prelude::*;
use tessel_driver::{seed_from_env, DispatchMode};

use common::{dram_buffer, f32_bytes, open_mesh, open_mesh_with, range, to_f32s};

const ELEMENTS: usize = 256;
const PAGE: u32 = 64;

fn worker_cores() -> CoreRange {
    CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1))
}

/// Three chained stages of element-wise ops on different sub-grids of a
/// 2x4 mesh: rows, then rows with the ops swapped, then three column groups.
struct Eltwise {
    src0: MeshBuffer,
    src1: MeshBuffer,
    out: MeshBuffer,
    stages: Vec<MeshWorkload>,
    _intermediates: [MeshBuffer; 2],
}

impl Eltwise {
    fn build(mesh: &MeshDevice) -> Self {
        let size = (ELEMENTS * 4) as u32;
        let buf = || dram_buffer(mesh, size, PAGE);
        let (src0, src1, int0, int1, out) = (buf(), buf(), buf(), buf(), buf());
        let program = |op, a: &MeshBuffer, b: &MeshBuffer, dst: &MeshBuffer| {
            eltwise_program(op, a, b, dst, worker_cores()).unwrap()
        };

        let mut first = MeshWorkload::new();
        first.add_program(program(BinaryOp::Add, &src0, &src1, &int0), range(0, 0, 0, 3)).unwrap();
        first.add_program(program(BinaryOp::Mul, &src0, &src1, &int0), range(1, 0, 1, 3)).unwrap();

        let mut second = MeshWorkload::new();
        second.add_program(program(BinaryOp::Mul, &int0, &src1, &int1), range(0, 0, 0, 3)).unwrap();
        second.add_program(program(BinaryOp::Add, &int0, &src1, &int1), range(1, 0, 1, 3)).unwrap();

        let mut third = MeshWorkload::new();
        third.add_program(program(BinaryOp::Add, &int1, &src1, &out), range(0, 0, 1, 1)).unwrap();
        third.add_program(program(BinaryOp::Mul, &int1, &src1, &out), range(0, 2, 1, 2)).unwrap();
        third.add_program(program(BinaryOp::Sub, &int1, &src1, &out), range(0, 3, 1, 3)).unwrap();

        Self {
            src0,
            src1,
            out,
            stages: vec![first, second, third],
            _intermediates: [int0, int1],
        }
    }

    fn enqueue(&mut self, cq: &MeshCommandQueue<'_>) {
        for stage in &mut self.stages {
            cq.enqueue_workload(stage, false).unwrap();
        }
    }

    fn check(&self, mesh: &MeshDevice, cq: &MeshCommandQueue<'_>) {
        let expected = [18.0, 18.0, 45.0, 12.0, 12.0, 12.0, 27.0, 6.0];
        for coord in mesh.shape().coords() {
            let values = to_f32s(&cq.read_shard(&self.out, coord).unwrap());
            let want = expected[mesh.shape().linear_index(coord)];
            assert_eq!(values.len(), ELEMENTS);
            assert!(values.iter().all(|v| *v == want), "{coord}: expected {want}, got {:?}", &values[..4]);
        }
    }
}

#[test]
fn eltwise_trace_replays_deterministically() {
    let mesh = open_mesh(MeshShape::new(2, 4));
    let cq = mesh.command_queue(0).unwrap();
    let mut eltwise = Eltwise::build(&mesh);

    cq.write_buffer(&eltwise.src0, &f32_bytes(2.0, ELEMENTS), false).unwrap();
    cq.write_buffer(&eltwise.src1, &f32_bytes(3.0, ELEMENTS), false).unwrap();

    eltwise.enqueue(&cq);
    cq.finish().unwrap();
    eltwise.check(&mesh, &cq);

    let trace = mesh.begin_trace_capture(0).unwrap();
    eltwise.enqueue(&cq);
    mesh.end_trace_capture(0, trace).unwrap();

    for _ in 0..1000 {
        mesh.replay_trace(0, trace, false).unwrap();
    }
    cq.finish().unwrap();
    eltwise.check(&mesh, &cq);

    let pushes: Vec<u64> = eltwise.stages.iter().map(MeshWorkload::runtime_arg_pushes).collect();
    assert_eq!(pushes, vec![2, 2, 3]);
    mesh.release_trace(trace).unwrap();
}

#[test]
fn replay_does_not_reenqueue_from_host() {
    let mesh = open_mesh(MeshShape::new(1, 2));
    let cq = mesh.command_queue(0).unwrap();
    let counter = GlobalSemaphore::create(&mesh, CoreCoord::new(0, 0), 0).unwrap();
    let mut workload = MeshWorkload::new();
    workload
        .add_program(
            counter_program("count", CoreCoord::new(0, 0), counter.address()).unwrap(),
            LogicalDeviceRange::full(mesh.shape()),
        )
        .unwrap();

    let trace = mesh.begin_trace_capture(0).unwrap();
    cq.enqueue_workload(&mut workload, false).unwrap();
    cq.enqueue_workload(&mut workload, false).unwrap();
    mesh.end_trace_capture(0, trace).unwrap();
    for _ in 0..10 {
        mesh.replay_trace(0, trace, false).unwrap();
    }
    mesh.replay_trace(0, trace, true).unwrap();

    // Capture runs live: 2 launches, then 11 replays of 2.
    for coord in mesh.shape().coords() {
        assert_eq!(mesh.read_core_u32(coord, CoreCoord::new(0, 0), counter.address()).unwrap(), 24);
    }
    assert_eq!(workload.runtime_arg_pushes(), 1);
    mesh.release_trace(trace).unwrap();
}

#[test]
fn random_workloads_sanity() {
    let seed = seed_from_env(10);
    let mut rng = StdRng::seed_from_u64(seed);
    let mesh = open_mesh(MeshShape::new(2, 4));
    let cq = mesh.command_queue(0).unwrap();
    let chip = *mesh.chip();
    let counter = GlobalSemaphore::create(&mesh, chip.worker_grid(), 0).unwrap();

    let (num_traces, per_trace, iters) = (4, 5, 10);
    let programs = random_programs(&mut rng, &chip, num_traces * per_trace, counter.address()).unwrap();
    let mut runs: HashMap<CoreCoord, u32> = HashMap::new();
    for p in &programs {
        for core in p.cores(CoreType::Tensix).iter() {
            *runs.entry(core).or_default() += 1;
        }
    }
    let mut workloads: Vec<MeshWorkload> = programs
        .into_iter()
        .map(|p| {
            let mut w = MeshWorkload::new();
            w.add_program(p, LogicalDeviceRange::full(mesh.shape())).unwrap();
            w
        })
        .collect();

    for w in &mut workloads {
        cq.enqueue_workload(w, false).unwrap();
    }
    let mut traces = Vec::new();
    for chunk in workloads.chunks_mut(per_trace) {
        let trace = mesh.begin_trace_capture(0).unwrap();
        for w in chunk {
            cq.enqueue_workload(w, false).unwrap();
        }
        mesh.end_trace_capture(0, trace).unwrap();
        traces.push(trace);
    }
    for _ in 0..iters {
        for trace in &traces {
            mesh.replay_trace(0, *trace, false).unwrap();
        }
    }
    cq.finish().unwrap();

    let total = 2 + iters as u32;
    for coord in mesh.shape().coords() {
        for core in chip.worker_grid().iter() {
            let got = mesh.read_core_u32(coord, core, counter.address()).unwrap();
            assert_eq!(got, runs.get(&core).copied().unwrap_or(0) * total, "{coord} core {core}, seed {seed}");
        }
    }
    for trace in traces {
        mesh.release_trace(trace).unwrap();
    }
    assert_eq!(mesh.num_traces(), 0);
}

#[test]
fn capture_state_machine() {
    let mesh = open_mesh(MeshShape::new(1, 2));

    assert!(matches!(
        mesh.end_trace_capture(0, mesh.begin_trace_capture(0).unwrap()),
        Ok(())
    ));
    let first = mesh.begin_trace_capture(0).unwrap();
    assert!(matches!(
        mesh.begin_trace_capture(0),
        Err(TesselError::CaptureAlreadyActive { queue: 0 })
    ));
    assert!(matches!(
        mesh.replay_trace(0, first, false),
        Err(TesselError::InvalidState { .. })
    ));
    mesh.end_trace_capture(0, first).unwrap();
    assert!(matches!(
        mesh.end_trace_capture(0, first),
        Err(TesselError::NoActiveCapture { queue: 0 })
    ));

    mesh.replay_trace(0, first, true).unwrap();
    mesh.release_trace(first).unwrap();
    assert!(matches!(
        mesh.release_trace(first),
        Err(TesselError::InvalidTraceHandle { .. })
    ));
    assert!(matches!(
        mesh.replay_trace(0, first, false),
        Err(TesselError::InvalidTraceHandle { .. })
    ));

    // A recycled slot does not revive the stale handle.
    let second = mesh.begin_trace_capture(0).unwrap();
    assert_ne!(first, second);
    mesh.end_trace_capture(0, second).unwrap();
    assert!(matches!(
        mesh.replay_trace(0, first, false),
        Err(TesselError::InvalidTraceHandle { .. })
    ));
}

#[test]
fn end_with_wrong_id_keeps_capture_open() {
    let mesh = open_mesh(MeshShape::new(1, 1));
    let sealed = mesh.begin_trace_capture(0).unwrap();
    mesh.end_trace_capture(0, sealed).unwrap();

    let live = mesh.begin_trace_capture(0).unwrap();
    assert!(matches!(
        mesh.end_trace_capture(0, sealed),
        Err(TesselError::NoActiveCapture { queue: 0 })
    ));
    mesh.end_trace_capture(0, live).unwrap();
    assert_eq!(mesh.num_traces(), 2);
}

#[test]
fn trace_region_exhaustion_releases_handle() {
    let mesh = open_mesh_with(
        MeshShape::new(1, 2),
        RuntimeConfig::default().with_trace_region_size(64),
    );
    let cq = mesh.command_queue(0).unwrap();
    let counter = GlobalSemaphore::create(&mesh, CoreCoord::new(0, 0), 0).unwrap();
    let mut workload = MeshWorkload::new();
    workload
        .add_program(
            counter_program("count", CoreCoord::new(0, 0), counter.address()).unwrap(),
            LogicalDeviceRange::full(mesh.shape()),
        )
        .unwrap();

    let trace = mesh.begin_trace_capture(0).unwrap();
    for _ in 0..16 {
        cq.enqueue_workload(&mut workload, false).unwrap();
    }
    assert!(matches!(
        mesh.end_trace_capture(0, trace),
        Err(TesselError::TraceRegionExhausted { capacity: 64, .. })
    ));
    assert_eq!(mesh.num_traces(), 0);
    assert!(matches!(
        mesh.replay_trace(0, trace, false),
        Err(TesselError::InvalidTraceHandle { .. })
    ));
    cq.finish().unwrap();
}

#[test]
fn queues_capture_independently() {
    let mesh = open_mesh_with(MeshShape::new(1, 2), RuntimeConfig::default().with_command_queues(2));
    let a = mesh.begin_trace_capture(0).unwrap();
    let b = mesh.begin_trace_capture(1).unwrap();
    mesh.end_trace_capture(1, b).unwrap();
    mesh.end_trace_capture(0, a).unwrap();
    mesh.replay_trace(1, b, true).unwrap();
    assert!(matches!(
        mesh.replay_trace(1, a, false),
        Err(TesselError::InvalidState { .. })
    ));
    assert!(matches!(
        mesh.begin_trace_capture(2),
        Err(TesselError::InvalidQueue { index: 2, count: 2 })
    ));
}

#[test]
fn slow_dispatch_runs_but_cannot_capture() {
    let mesh = open_mesh_with(
        MeshShape::new(2, 4),
        RuntimeConfig::default().with_dispatch_mode(DispatchMode::Slow),
    );
    let cq = mesh.command_queue(0).unwrap();
    let mut eltwise = Eltwise::build(&mesh);
    cq.write_buffer(&eltwise.src0, &f32_bytes(2.0, ELEMENTS), true).unwrap();
    cq.write_buffer(&eltwise.src1, &f32_bytes(3.0, ELEMENTS), true).unwrap();
    eltwise.enqueue(&cq);
    eltwise.check(&mesh, &cq);

    assert!(matches!(
        mesh.begin_trace_capture(0),
        Err(TesselError::InvalidState { .. })
    ));
}

#[test]
fn sub_grid_sweep_has_no_cross_talk() {
    let mesh = open_mesh(MeshShape::new(4, 2));
    let cq = mesh.command_queue(0).unwrap();
    let row = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(7, 0));
    let counter = GlobalSemaphore::create(&mesh, row, 0).unwrap();

    let per_device: Vec<LogicalDeviceRange> = mesh
        .shape()
        .coords()
        .map(LogicalDeviceRange::single)
        .collect();
    let configs: Vec<Vec<LogicalDeviceRange>> = vec![
        vec![range(0, 0, 3, 0), range(0, 1, 3, 1)],
        vec![range(0, 0, 3, 1)],
        per_device,
        vec![range(0, 0, 1, 0), range(0, 1, 1, 1), range(2, 0, 3, 0), range(2, 1, 3, 1)],
        (0..4).map(|r| range(r, 0, r, 1)).collect(),
    ];
    let (num_workloads, replays) = (10, 50);

    for ranges in &configs {
        counter.reset_value(0).unwrap();
        // Range k counts on core (k, 0) only.
        let mut workloads: Vec<MeshWorkload> = (0..num_workloads)
            .map(|_| {
                let mut w = MeshWorkload::new();
                for (k, r) in ranges.iter().enumerate() {
                    let core = CoreCoord::new(k as u32, 0);
                    w.add_program(counter_program("count", core, counter.address()).unwrap(), *r)
                        .unwrap();
                }
                w
            })
            .collect();

        let trace = mesh.begin_trace_capture(0).unwrap();
        for w in &mut workloads {
            cq.enqueue_workload(w, false).unwrap();
        }
        mesh.end_trace_capture(0, trace).unwrap();
        for _ in 0..replays {
            mesh.replay_trace(0, trace, false).unwrap();
        }
        cq.finish().unwrap();

        let runs = num_workloads * (1 + replays);
        for coord in mesh.shape().coords() {
            let owner = ranges.iter().position(|r| r.contains(coord)).unwrap();
            for k in 0..ranges.len() {
                let got = mesh
                    .read_core_u32(coord, CoreCoord::new(k as u32, 0), counter.address())
                    .unwrap();
                let want = if k == owner { runs } else { 0 };
                assert_eq!(got, want, "{coord}: core ({k}, 0) with {} range(s)", ranges.len());
            }
        }
        mesh.release_trace(trace).unwrap();
    }
}
