//! `tessel`: command-line interface for the tessel mesh runtime.
//!
//! ```text
//! USAGE:
//!   tessel enumerate                      List devices and their links
//!   tessel open <rows> <cols>             Map a logical mesh onto the system
//!   tessel trace-sanity                   Capture and replay random workloads
//!   tessel fabric-smoke                   Drive traffic over an EDM line
//! ```
//!
//! Runtime knobs come from the `TESSEL_*` environment variables.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tessel_chip::{boustrophedon, CoreCoord, CoreRange, CoreType, LogicalDeviceRange, MeshCoordinate, MeshShape};
use tessel_driver::chip::TerminationSignal;
use tessel_driver::kernels::random_programs;
use tessel_driver::prelude::*;
use tessel_driver::{
    seed_from_env, EdmConfig, EdmLineFabric, FabricMode, FabricWriter, PhysicalDeviceId, WriterSchedule,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessel", about = "Multi-chip mesh runtime CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List every device, its grid position and its ethernet neighbours.
    Enumerate,
    /// Open a mesh and print the physical device behind each coordinate.
    Open {
        /// Logical rows.
        rows: u32,
        /// Logical columns.
        cols: u32,
        /// Offset into the physical grid as `row,col`.
        #[arg(long, value_parser = parse_coord)]
        offset: Option<MeshCoordinate>,
        /// Reshape to `rows,cols` after opening.
        #[arg(long, value_parser = parse_shape)]
        reshape: Option<MeshShape>,
    },
    /// Capture random counter workloads into traces and check replay counts.
    TraceSanity {
        /// Number of traces.
        #[arg(long, default_value_t = 4)]
        traces: usize,
        /// Workloads per trace.
        #[arg(long, default_value_t = 5)]
        workloads: usize,
        /// Replays of every trace.
        #[arg(long, default_value_t = 10)]
        iters: u32,
    },
    /// Run a multicast/unicast writer over an EDM line of every device.
    FabricSmoke {
        /// How the data movers are launched and torn down.
        #[arg(long, value_enum, default_value_t = Lifetime::Transient)]
        mode: Lifetime,
        /// Links per neighbour pair.
        #[arg(long, default_value_t = 1)]
        links: u32,
        /// Multicasts per worker.
        #[arg(long, default_value_t = 8)]
        mcasts: u32,
        /// Bytes per packet.
        #[arg(long, default_value_t = 1024)]
        payload: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Lifetime {
    Transient,
    Persistent,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate(),
        Cmd::Open {
            rows,
            cols,
            offset,
            reshape,
        } => cmd_open(rows, cols, offset, reshape)?,
        Cmd::TraceSanity {
            traces,
            workloads,
            iters,
        } => cmd_trace_sanity(traces, workloads, iters)?,
        Cmd::FabricSmoke {
            mode,
            links,
            mcasts,
            payload,
        } => cmd_fabric_smoke(mode, links, mcasts, payload)?,
    }

    Ok(())
}

fn parse_pair(s: &str) -> std::result::Result<(u32, u32), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `a,b`, got `{s}`"))?;
    let parse = |v: &str| v.trim().parse::<u32>().map_err(|e| format!("`{v}`: {e}"));
    Ok((parse(a)?, parse(b)?))
}

fn parse_coord(s: &str) -> std::result::Result<MeshCoordinate, String> {
    parse_pair(s).map(|(r, c)| MeshCoordinate::new(r, c))
}

fn parse_shape(s: &str) -> std::result::Result<MeshShape, String> {
    parse_pair(s).map(|(r, c)| MeshShape::new(r, c))
}

fn system() -> Arc<SystemMesh> {
    Arc::new(SystemMesh::new(SystemConfig::T3000))
}

fn open_mesh(system: Arc<SystemMesh>, shape: MeshShape) -> Result<MeshDevice> {
    let config = MeshDeviceConfig::new(shape).with_runtime(RuntimeConfig::from_env());
    MeshDevice::open(system, config).with_context(|| format!("opening {shape} mesh"))
}

fn cmd_enumerate() {
    let system = system();
    let chip = system.chip();
    println!("Devices: {}", system.get_num_available_devices());
    println!(
        "Chip   : {}×{} workers, {} ethernet cores, {} KiB L1",
        chip.grid_x,
        chip.grid_y,
        chip.num_ethernet_cores,
        chip.l1_size / 1024
    );
    println!();

    for device in system.devices() {
        let id = device.id();
        let (row, col) = system.position(id);
        let mut neighbours: Vec<(PhysicalDeviceId, usize)> = Vec::new();
        for core in chip.ethernet_cores().iter() {
            if let Some((peer, _)) = system.get_connected_neighbor(id, core) {
                match neighbours.iter_mut().find(|(p, _)| *p == peer) {
                    Some((_, links)) => *links += 1,
                    None => neighbours.push((peer, 1)),
                }
            }
        }
        neighbours.sort_unstable();
        let peers: Vec<String> = neighbours
            .iter()
            .map(|(peer, links)| format!("{peer}×{links}"))
            .collect();
        println!(
            "[{id}] grid ({row},{col})  links {}  {}",
            peers.join(" "),
            if device.is_claimed() { "claimed" } else { "free" }
        );
    }
}

fn print_mapping(mesh: &MeshDevice) {
    println!("Mesh {} ({} devices)", mesh.shape(), mesh.num_devices());
    for coord in mesh.shape().coords() {
        if let Ok(device) = mesh.device_at(coord) {
            let (row, col) = mesh.system().position(device.id());
            println!("  {coord} -> device {} at grid ({row},{col})", device.id());
        }
    }
}

fn cmd_open(rows: u32, cols: u32, offset: Option<MeshCoordinate>, reshape: Option<MeshShape>) -> Result<()> {
    let mut config = MeshDeviceConfig::new(MeshShape::new(rows, cols)).with_runtime(RuntimeConfig::from_env());
    if let Some(offset) = offset {
        config = config.with_offset(offset);
    }
    let mut mesh = MeshDevice::open(system(), config)?;
    print_mapping(&mesh);

    if let Some(shape) = reshape {
        mesh.reshape(shape)?;
        println!();
        print_mapping(&mesh);
    }
    mesh.close()?;
    Ok(())
}

fn cmd_trace_sanity(num_traces: usize, per_trace: usize, iters: u32) -> Result<()> {
    let seed = seed_from_env(10);
    let mut rng = StdRng::seed_from_u64(seed);
    info!("Trace sanity: seed {seed}, {num_traces} trace(s) of {per_trace} workload(s), {iters} replay(s)");

    let mut mesh = open_mesh(system(), MeshShape::new(2, 4))?;
    let chip = *mesh.chip();
    let counter = GlobalSemaphore::create(&mesh, chip.worker_grid(), 0)?;
    let programs = random_programs(&mut rng, &chip, num_traces * per_trace, counter.address())?;

    let mut expected = vec![0u32; chip.num_workers() as usize];
    for program in &programs {
        for core in program.cores(CoreType::Tensix).iter() {
            expected[(core.y * chip.grid_x + core.x) as usize] += 2 + iters;
        }
    }
    let mut workloads = Vec::with_capacity(programs.len());
    for program in programs {
        let mut workload = MeshWorkload::new();
        workload.add_program(program, LogicalDeviceRange::full(mesh.shape()))?;
        workloads.push(workload);
    }

    let cq = mesh.command_queue(0)?;
    for workload in &mut workloads {
        cq.enqueue_workload(workload, false)?;
    }
    let mut traces = Vec::with_capacity(num_traces);
    for chunk in workloads.chunks_mut(per_trace.max(1)) {
        let trace = mesh.begin_trace_capture(0)?;
        for workload in chunk {
            cq.enqueue_workload(workload, false)?;
        }
        mesh.end_trace_capture(0, trace)?;
        traces.push(trace);
    }

    let start = Instant::now();
    for _ in 0..iters {
        for &trace in &traces {
            mesh.replay_trace(0, trace, false)?;
        }
    }
    cq.finish()?;
    let elapsed = start.elapsed();

    let mut mismatches = 0usize;
    for coord in mesh.shape().coords() {
        for core in chip.worker_grid().iter() {
            let got = mesh.read_core_u32(coord, core, counter.address())?;
            let want = expected[(core.y * chip.grid_x + core.x) as usize];
            if got != want {
                mismatches += 1;
                tracing::error!("{coord} core {core}: counted {got}, expected {want}");
            }
        }
    }
    for trace in traces {
        mesh.release_trace(trace)?;
    }
    drop(counter);
    mesh.close()?;

    println!(
        "{} replay(s) of {num_traces} trace(s) in {:.2?} (seed {seed})",
        iters as usize * num_traces,
        elapsed
    );
    if mismatches > 0 {
        bail!("{mismatches} core counter(s) disagree");
    }
    println!("All counters match");
    Ok(())
}

fn cmd_fabric_smoke(mode: Lifetime, links: u32, mcasts: u32, payload: u32) -> Result<()> {
    let mut mesh = open_mesh(system(), MeshShape::new(2, 4))?;
    let chip = *mesh.chip();
    let mode = match mode {
        Lifetime::Transient => FabricMode::Transient,
        Lifetime::Persistent => {
            let manager = mesh.create_sub_device_manager(
                vec![
                    SubDevice::tensix(chip.worker_grid()),
                    SubDevice::ethernet(chip.ethernet_cores()),
                ],
                0,
            )?;
            mesh.load_sub_device_manager(manager)?;
            FabricMode::Persistent
        }
    };

    let line: Vec<MeshCoordinate> = boustrophedon(mesh.num_rows(), mesh.num_cols())
        .into_iter()
        .map(|(r, c)| MeshCoordinate::new(r, c))
        .collect();
    let config = EdmConfig {
        num_links: links,
        ..EdmConfig::default()
    };
    let fabric = EdmLineFabric::new(&mesh, &line, mode, config)?;
    let line_size = fabric.line_size();

    let sync = GlobalSemaphore::create(&mesh, CoreCoord::new(0, 0), 0)?;
    let results = GlobalSemaphore::create(&mesh, CoreCoord::new(0, 0), 0)?;
    let slots = MeshBuffer::create(
        &mesh,
        DeviceLocalBufferConfig {
            page_size: payload,
            buffer_type: BufferType::L1,
        },
        GlobalBufferConfig::Replicated {
            size: 2 * line_size as u32 * payload,
        },
    )?;

    let mut writers = MeshWorkload::new();
    for i in 0..line_size {
        let schedule = WriterSchedule {
            dest_core: CoreCoord::new(2, 2),
            dest_addr: slots.address(),
            payload_size: payload,
            num_mcasts: mcasts,
            num_unicasts: 0,
            unicast_hops: 1,
            unicast_is_fwd: true,
            line_sync: Some((CoreCoord::new(0, 0), sync.address())),
            result_addr: results.address(),
            terminate: mode == FabricMode::Transient,
        };
        let mut program = Program::new(format!("fabric_writer_{i}"));
        let workers = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(links - 1, 0));
        let handle = program.add_kernel(Arc::new(FabricWriter), workers, KernelConfig::tensix())?;
        for link in 0..links {
            let args = fabric.writer_args(i, link, &schedule)?;
            program.set_runtime_args(handle, CoreCoord::new(link, 0), args.to_args())?;
        }
        if mode == FabricMode::Transient {
            fabric.add_edm_kernels(&mut program, i)?;
        }
        let coord = fabric.coord(i).context("fabric line position")?;
        writers.add_program(program, LogicalDeviceRange::single(coord))?;
    }

    let cq = mesh.command_queue(0)?;
    let start = Instant::now();
    match mode {
        FabricMode::Transient => cq.enqueue_workload(&mut writers, true)?,
        FabricMode::Persistent => {
            let mut edms = fabric.fabric_workload()?;
            cq.enqueue_workload(&mut edms, false)?;
            cq.enqueue_workload(&mut writers, false)?;
            fabric.teardown(&cq, &[SubDeviceId(0)], &[SubDeviceId(1)], TerminationSignal::Graceful)?;
        }
    }
    let elapsed = start.elapsed();

    let stats = fabric.stats();
    println!(
        "{mode:?} fabric over {line_size} device(s), {links} link(s): {} packet(s) in {elapsed:.2?}, {} dropped",
        stats.retired(),
        stats.dropped()
    );
    drop(fabric);
    drop((sync, results, slots));
    mesh.close()?;
    Ok(())
}
