//! Sub-device managers, stall groups and traces across sub-devices.

mod common;

use tessel_driver::kernels::{counter_program, gated_copy_program, host_sync_program, sync_programs};
use tessel_driver::prelude::*;

use common::{dram_buffer, open_mesh, range};

fn rect(x0: u32, y0: u32, x1: u32, y1: u32) -> CoreRange {
    CoreRange::new(CoreCoord::new(x0, y0), CoreCoord::new(x1, y1))
}

fn single(x: u32, y: u32) -> CoreRange {
    CoreRange::single(CoreCoord::new(x, y))
}

/// Sub-device 0: a 3x3 block. Sub-device 1: two cores on the diagonal.
fn two_partitions() -> Vec<SubDevice> {
    vec![
        SubDevice::tensix(rect(0, 0, 2, 2)),
        SubDevice::tensix(CoreRangeSet::new([single(3, 3), single(4, 4)])),
    ]
}

fn full_mesh_workload(mesh: &MeshDevice, program: Program) -> MeshWorkload {
    let mut w = MeshWorkload::new();
    w.add_program(program, LogicalDeviceRange::full(mesh.shape())).unwrap();
    w
}

#[test]
fn stall_group_lets_host_pass_a_blocked_sub_device() {
    let mut mesh = open_mesh(MeshShape::new(2, 4));
    let manager = mesh.create_sub_device_manager(two_partitions(), 3200).unwrap();
    mesh.load_sub_device_manager(manager).unwrap();
    assert_eq!(mesh.get_sub_device_ids(), vec![SubDeviceId(0), SubDeviceId(1)]);

    let waiter_core = CoreCoord::new(3, 3);
    let syncer_core = CoreCoord::new(0, 0);
    let sem = GlobalSemaphore::create(
        &mesh,
        CoreRangeSet::new([CoreRange::single(waiter_core), CoreRange::single(syncer_core)]),
        0,
    )
    .unwrap();
    let programs = sync_programs(waiter_core, syncer_core, rect(0, 0, 2, 2), sem.address()).unwrap();
    let mut waiter = full_mesh_workload(&mesh, programs.waiter);
    let mut syncer = full_mesh_workload(&mesh, programs.syncer);
    let mut incrementer = full_mesh_workload(&mesh, programs.incrementer);

    let cq = mesh.command_queue(0).unwrap();
    let mut handshake = |live: bool| {
        cq.enqueue_workload(&mut waiter, false).unwrap();
        cq.set_stall_group(&[SubDeviceId(0)]).unwrap();
        // The waiter is still blocked on sub-device 1; this must return.
        cq.enqueue_workload(&mut syncer, live).unwrap();
        cq.enqueue_workload(&mut incrementer, false).unwrap();
        cq.reset_stall_group();
    };

    handshake(true);
    cq.finish().unwrap();

    let trace = mesh.begin_trace_capture(0).unwrap();
    handshake(false);
    mesh.end_trace_capture(0, trace).unwrap();

    let replays = 20;
    for _ in 0..replays {
        mesh.replay_trace(0, trace, false).unwrap();
    }
    cq.finish().unwrap();

    for coord in mesh.shape().coords() {
        assert_eq!(mesh.read_core_u32(coord, waiter_core, sem.address()).unwrap(), 0);
        assert_eq!(
            mesh.read_core_u32(coord, syncer_core, sem.address() + 4).unwrap(),
            2 + replays
        );
    }
    mesh.release_trace(trace).unwrap();
    drop(sem);
    mesh.clear_loaded_sub_device_manager().unwrap();
    mesh.remove_sub_device_manager(manager).unwrap();
}

#[test]
fn manager_validation() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let chip = *mesh.chip();

    let overlapping = vec![SubDevice::tensix(rect(0, 0, 2, 2)), SubDevice::tensix(rect(2, 2, 3, 3))];
    assert!(matches!(
        mesh.create_sub_device_manager(overlapping, 0),
        Err(TesselError::Overlap { .. })
    ));

    let off_chip = vec![SubDevice::tensix(single(chip.grid_x, 0))];
    assert!(matches!(
        mesh.create_sub_device_manager(off_chip, 0),
        Err(TesselError::TooManyCores { .. })
    ));

    let bad_eth = vec![SubDevice::ethernet(single(0, 1))];
    assert!(matches!(
        mesh.create_sub_device_manager(bad_eth, 0),
        Err(TesselError::TooManyCores { .. })
    ));

    assert!(matches!(
        mesh.create_sub_device_manager(Vec::new(), 0),
        Err(TesselError::InvalidSubDevice { .. })
    ));
    assert!(matches!(
        mesh.create_sub_device_manager(vec![SubDevice::default()], 0),
        Err(TesselError::InvalidSubDevice { .. })
    ));
    assert!(matches!(
        mesh.create_sub_device_manager(two_partitions(), chip.l1_size),
        Err(TesselError::OutOfMemory { .. })
    ));

    // Ethernet and worker cores of the same coordinate do not collide.
    let split = vec![SubDevice::tensix(single(0, 0)), SubDevice::ethernet(single(0, 0))];
    mesh.create_sub_device_manager(split, 0).unwrap();
}

#[test]
fn active_manager_cannot_be_removed() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let id = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    assert!(matches!(
        mesh.remove_sub_device_manager(id),
        Err(TesselError::InvalidState { .. })
    ));

    mesh.clear_loaded_sub_device_manager().unwrap();
    assert_eq!(mesh.get_sub_device_ids(), vec![SubDeviceId(0)]);
    mesh.remove_sub_device_manager(id).unwrap();
    assert!(matches!(
        mesh.remove_sub_device_manager(id),
        Err(TesselError::InvalidSubDevice { .. })
    ));
    assert!(matches!(
        mesh.load_sub_device_manager(id),
        Err(TesselError::InvalidSubDevice { .. })
    ));
}

#[test]
fn worker_cores_follow_the_active_manager() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let chip = *mesh.chip();
    let all = mesh.worker_cores(CoreType::Tensix, SubDeviceId(0)).unwrap();
    assert_eq!(all.num_cores(), chip.worker_grid().num_cores());
    assert_eq!(
        mesh.worker_cores(CoreType::Ethernet, SubDeviceId(0)).unwrap(),
        chip.ethernet_cores()
    );

    let id = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    let second = mesh.worker_cores(CoreType::Tensix, SubDeviceId(1)).unwrap();
    assert_eq!(second.num_cores(), 2);
    assert!(second.contains(CoreCoord::new(4, 4)));
    assert!(mesh.worker_cores(CoreType::Ethernet, SubDeviceId(1)).unwrap().is_empty());
    assert!(matches!(
        mesh.worker_cores(CoreType::Tensix, SubDeviceId(2)),
        Err(TesselError::InvalidSubDevice { .. })
    ));
}

#[test]
fn program_spanning_sub_devices_rejected() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let id = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    let sem = GlobalSemaphore::create(&mesh, rect(0, 0, 3, 3), 0).unwrap();

    let straddle = counter_program("straddle", rect(2, 2, 3, 3), sem.address()).unwrap();
    let mut straddling = full_mesh_workload(&mesh, straddle);
    let cq = mesh.command_queue(0).unwrap();
    assert!(matches!(
        cq.enqueue_workload(&mut straddling, true),
        Err(TesselError::InvalidSubDevice { .. })
    ));
    // Nothing was frozen by the failed plan.
    assert!(!straddling.is_frozen());
}

#[test]
fn manager_switch_rejected_during_capture() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let id = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    let trace = mesh.begin_trace_capture(0).unwrap();
    assert!(matches!(
        mesh.load_sub_device_manager(id),
        Err(TesselError::InvalidState { .. })
    ));
    mesh.end_trace_capture(0, trace).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
}

#[test]
fn local_l1_reservation_shrinks_the_allocator() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let chip = *mesh.chip();
    let available = chip.l1_size - chip.l1_unreserved_base;

    let id = mesh.create_sub_device_manager(two_partitions(), available - 8).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    assert!(matches!(
        GlobalSemaphore::create(&mesh, single(0, 0), 0),
        Err(TesselError::OutOfMemory { .. })
    ));

    mesh.clear_loaded_sub_device_manager().unwrap();
    GlobalSemaphore::create(&mesh, single(0, 0), 0).unwrap();
}

#[test]
fn stall_group_is_validated() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let cq = mesh.command_queue(0).unwrap();
    assert!(matches!(
        cq.set_stall_group(&[SubDeviceId(1)]),
        Err(TesselError::InvalidSubDevice { .. })
    ));

    let id = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    mesh.load_sub_device_manager(id).unwrap();
    let cq = mesh.command_queue(0).unwrap();
    cq.set_stall_group(&[SubDeviceId(1), SubDeviceId(0), SubDeviceId(1)]).unwrap();
    assert_eq!(cq.stall_group(), vec![SubDeviceId(0), SubDeviceId(1)]);
    cq.reset_stall_group();
    assert!(cq.stall_group().is_empty());
}

#[test]
fn replay_checks_partition_not_manager_id() {
    let mut mesh = open_mesh(MeshShape::new(1, 2));
    let first = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    let twin = mesh.create_sub_device_manager(two_partitions(), 0).unwrap();
    let coarse = mesh
        .create_sub_device_manager(vec![SubDevice::tensix(rect(0, 0, 4, 4))], 0)
        .unwrap();
    mesh.load_sub_device_manager(first).unwrap();

    let core = CoreCoord::new(4, 4);
    let sem = GlobalSemaphore::create(&mesh, single(4, 4), 0).unwrap();
    let mut count = full_mesh_workload(&mesh, counter_program("count", core, sem.address()).unwrap());
    let trace = mesh.begin_trace_capture(0).unwrap();
    mesh.command_queue(0).unwrap().enqueue_workload(&mut count, false).unwrap();
    mesh.end_trace_capture(0, trace).unwrap();

    // Same cores under a new id.
    mesh.load_sub_device_manager(twin).unwrap();
    mesh.replay_trace(0, trace, true).unwrap();
    for coord in mesh.shape().coords() {
        assert_eq!(mesh.read_core_u32(coord, core, sem.address()).unwrap(), 2);
    }

    mesh.load_sub_device_manager(coarse).unwrap();
    assert!(matches!(
        mesh.replay_trace(0, trace, false),
        Err(TesselError::InvalidSubDevice { .. })
    ));
    mesh.clear_loaded_sub_device_manager().unwrap();
    assert!(matches!(
        mesh.replay_trace(0, trace, false),
        Err(TesselError::InvalidSubDevice { .. })
    ));

    mesh.load_sub_device_manager(first).unwrap();
    mesh.replay_trace(0, trace, true).unwrap();
    let coord = MeshCoordinate::new(0, 1);
    assert_eq!(mesh.read_core_u32(coord, core, sem.address()).unwrap(), 3);
    mesh.release_trace(trace).unwrap();
}

/// Host pokes a syncer, which releases a copy on its own sub-device; on the
/// bottom row that copy in turn releases an add on a third one.
#[test]
fn data_copy_chain_on_sub_devices_replays() {
    const WORDS: usize = 1024;

    let mut mesh = open_mesh(MeshShape::new(2, 4));
    let syncer_core = CoreCoord::new(0, 0);
    let copy_core = CoreCoord::new(1, 1);
    let add_core = CoreCoord::new(3, 3);
    let partitions = vec![
        SubDevice::tensix(CoreRange::single(syncer_core)),
        SubDevice::tensix(CoreRange::single(copy_core)),
        SubDevice::tensix(single(2, 2)),
        SubDevice::tensix(CoreRange::single(add_core)),
    ];
    let manager = mesh.create_sub_device_manager(partitions, 3200).unwrap();
    mesh.load_sub_device_manager(manager).unwrap();
    let idle = [SubDeviceId(2)];

    let input = dram_buffer(&mesh, (WORDS * 4) as u32, 1024);
    let output = dram_buffer(&mesh, (WORDS * 4) as u32, 1024);
    let sem = GlobalSemaphore::create(
        &mesh,
        CoreRangeSet::new([
            CoreRange::single(syncer_core),
            CoreRange::single(copy_core),
            CoreRange::single(add_core),
        ]),
        0,
    )
    .unwrap();

    let mut syncer = full_mesh_workload(&mesh, host_sync_program(syncer_core, sem.address(), copy_core).unwrap());
    let mut datacopy = MeshWorkload::new();
    datacopy
        .add_program(
            gated_copy_program(copy_core, &input, &output, sem.address(), 0, None).unwrap(),
            range(0, 0, 0, 3),
        )
        .unwrap();
    datacopy
        .add_program(
            gated_copy_program(copy_core, &input, &output, sem.address(), 1, Some(add_core)).unwrap(),
            range(1, 0, 1, 3),
        )
        .unwrap();
    let mut add = MeshWorkload::new();
    add.add_program(
        gated_copy_program(add_core, &output, &output, sem.address(), 2, None).unwrap(),
        range(1, 0, 1, 3),
    )
    .unwrap();

    let cq = mesh.command_queue(0).unwrap();
    let poke = || {
        for coord in mesh.shape().coords() {
            mesh.write_core(coord, syncer_core, sem.address(), &1u32.to_le_bytes()).unwrap();
        }
    };
    let mut enqueue_all = || {
        cq.enqueue_workload(&mut syncer, false).unwrap();
        cq.enqueue_workload(&mut datacopy, false).unwrap();
        cq.enqueue_workload(&mut add, false).unwrap();
    };

    cq.set_stall_group(&idle).unwrap();
    enqueue_all();
    poke();
    cq.reset_stall_group();
    cq.finish().unwrap();

    let trace = mesh.begin_trace_capture(0).unwrap();
    enqueue_all();
    mesh.end_trace_capture(0, trace).unwrap();
    poke();
    cq.finish().unwrap();

    for i in 0..50u32 {
        mesh.replay_trace(0, trace, false).unwrap();
        // Only the idle sub-device gates the write; the others are parked.
        cq.set_stall_group(&idle).unwrap();
        let src: Vec<u32> = (i..i + WORDS as u32).collect();
        let bytes: Vec<u8> = src.iter().flat_map(|v| v.to_le_bytes()).collect();
        cq.write_buffer(&input, &bytes, true).unwrap();
        poke();
        cq.reset_stall_group();

        for coord in mesh.shape().coords() {
            let got: Vec<u32> = cq
                .read_shard(&output, coord)
                .unwrap()
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .collect();
            let offset = if coord.row() == 0 { 0 } else { 3 };
            assert!(
                got.iter().zip(&src).all(|(g, s)| *g == s + offset),
                "iteration {i}, device {coord}"
            );
        }
    }
    mesh.release_trace(trace).unwrap();
}
