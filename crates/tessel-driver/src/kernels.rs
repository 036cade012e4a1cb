//! Built-in kernels
//!
//! Small kernels used by tests, the CLI and the sanity workloads. Runtime
//! argument layouts are documented per kernel; buffers travel as the three
//! words of [`InterleavedBuffer::to_args`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tessel_chip::{ChipSpec, CoreCoord, CoreRange, CoreRangeSet};

use crate::buffer::{InterleavedBuffer, MeshBuffer};
use crate::error::{Result, TesselError};
use crate::program::{Kernel, KernelConfig, KernelContext, Program};

/// Element-wise operation of [`EltwiseBinary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
}

impl BinaryOp {
    /// Apply to one element pair.
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
        }
    }
}

fn f32s(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

/// `dst = src0 op src1` over little-endian f32 pages.
///
/// Runtime args: `src0[3] src1[3] dst[3] start_page num_pages`.
#[derive(Debug, Clone, Copy)]
pub struct EltwiseBinary {
    /// Operation applied per element
    pub op: BinaryOp,
}

impl Kernel for EltwiseBinary {
    fn name(&self) -> &str {
        match self.op {
            BinaryOp::Add => "eltwise_add",
            BinaryOp::Sub => "eltwise_sub",
            BinaryOp::Mul => "eltwise_mul",
        }
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let args = ctx.args();
        if args.len() < 11 {
            return Err(TesselError::kernel_argument(format!(
                "{} needs 11 args, got {}",
                self.name(),
                args.len()
            )));
        }
        let src0 = InterleavedBuffer::from_args(&args[0..3])?;
        let src1 = InterleavedBuffer::from_args(&args[3..6])?;
        let dst = InterleavedBuffer::from_args(&args[6..9])?;
        let (start, count) = (args[9], args[10]);

        for page in start..start + count {
            let a = ctx.read_page(&src0, page)?;
            let b = ctx.read_page(&src1, page)?;
            let out: Vec<u8> = f32s(&a)
                .zip(f32s(&b))
                .flat_map(|(x, y)| self.op.apply(x, y).to_le_bytes())
                .collect();
            ctx.write_page(&dst, page, &out)?;
        }
        Ok(())
    }
}

/// Split `num_pages` as evenly as possible over `cores`, in core order.
fn split_pages(cores: &CoreRangeSet, num_pages: u32) -> Vec<(CoreCoord, u32, u32)> {
    let cores: Vec<CoreCoord> = cores.iter().collect();
    let n = cores.len() as u32;
    if n == 0 {
        return Vec::new();
    }
    let (base, extra) = (num_pages / n, num_pages % n);
    let mut start = 0;
    cores
        .into_iter()
        .enumerate()
        .map(|(i, core)| {
            let count = base + u32::from((i as u32) < extra);
            let slice = (core, start, count);
            start += count;
            slice
        })
        .collect()
}

/// Program running `dst = src0 op src1` over every page, pages spread
/// across `cores`.
///
/// # Errors
///
/// Returns error if the buffers disagree on page count or the kernel
/// cannot be placed.
pub fn eltwise_program(
    op: BinaryOp,
    src0: &MeshBuffer,
    src1: &MeshBuffer,
    dst: &MeshBuffer,
    cores: impl Into<CoreRangeSet>,
) -> Result<Program> {
    let num_pages = dst.num_pages();
    if src0.num_pages() != num_pages || src1.num_pages() != num_pages {
        return Err(TesselError::kernel_argument(format!(
            "eltwise over buffers of {}, {} and {} pages",
            src0.num_pages(),
            src1.num_pages(),
            num_pages
        )));
    }
    let cores = cores.into();
    let kernel = EltwiseBinary { op };
    let mut program = Program::new(kernel.name());
    let handle = program.add_kernel(Arc::new(kernel), cores.clone(), KernelConfig::tensix())?;
    for (core, start, count) in split_pages(&cores, num_pages) {
        let mut args = Vec::with_capacity(11);
        args.extend(src0.interleaved().to_args());
        args.extend(src1.interleaved().to_args());
        args.extend(dst.interleaved().to_args());
        args.extend([start, count]);
        program.set_runtime_args(handle, core, args)?;
    }
    Ok(program)
}

/// Copy pages between buffers, optionally gated and offset.
///
/// Runtime args: `src[3] dst[3] start_page num_pages gate_addr gate_value
/// add [notify_x notify_y]`. A non-zero `gate_addr` makes the copy wait
/// until the local semaphore there reaches `gate_value` and takes that much
/// off it. `add` is added to every u32 word. With the two trailing args the
/// semaphore at `gate_addr` on that worker core is bumped once the copy is
/// done.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataCopy;

impl Kernel for DataCopy {
    fn name(&self) -> &str {
        "data_copy"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let src = InterleavedBuffer::from_args(ctx.args())?;
        let dst = InterleavedBuffer::from_args(ctx.args().get(3..).unwrap_or_default())?;
        let (start, count) = (ctx.arg(6)?, ctx.arg(7)?);
        let (gate_addr, gate_value, add) = (ctx.arg(8)?, ctx.arg(9)?, ctx.arg(10)?);

        if gate_addr != 0 {
            ctx.semaphore_wait_min(gate_addr, gate_value)?;
            ctx.noc_semaphore_inc(ctx.noc_core(), gate_addr, gate_value.wrapping_neg())?;
        }
        for page in start..start + count {
            let mut data = ctx.read_page(&src, page)?;
            if add != 0 {
                for word in data.chunks_exact_mut(4) {
                    let v = u32::from_le_bytes([word[0], word[1], word[2], word[3]]).wrapping_add(add);
                    word.copy_from_slice(&v.to_le_bytes());
                }
            }
            ctx.write_page(&dst, page, &data)?;
        }
        if let Some(&[x, y]) = ctx.args().get(11..13) {
            let noc = ctx.worker_noc(CoreCoord::new(x, y));
            ctx.noc_semaphore_inc(noc, gate_addr, 1)?;
        }
        Ok(())
    }
}

/// Increment a semaphore on a worker core of this chip.
///
/// Runtime args: `core_x core_y address value` (logical core).
#[derive(Debug, Default, Clone, Copy)]
pub struct SemaphoreIncrement;

impl Kernel for SemaphoreIncrement {
    fn name(&self) -> &str {
        "semaphore_increment"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let noc = ctx.worker_noc(CoreCoord::new(ctx.arg(0)?, ctx.arg(1)?));
        ctx.noc_semaphore_inc(noc, ctx.arg(2)?, ctx.arg(3)?)?;
        Ok(())
    }
}

/// Wait until a local semaphore equals a value and clear it, then increment
/// one on another worker core.
///
/// Runtime args: `wait_addr wait_value core_x core_y inc_addr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncAndIncrement;

impl Kernel for SyncAndIncrement {
    fn name(&self) -> &str {
        "sync_and_increment"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let wait_addr = ctx.arg(0)?;
        ctx.semaphore_wait(wait_addr, ctx.arg(1)?)?;
        ctx.semaphore_set(wait_addr, 0)?;
        let noc = ctx.worker_noc(CoreCoord::new(ctx.arg(2)?, ctx.arg(3)?));
        ctx.noc_semaphore_inc(noc, ctx.arg(4)?, 1)?;
        Ok(())
    }
}

/// Wait until a local semaphore reaches `value`, then subtract `value`
/// atomically. Increments that land in between are kept, so the waiter can
/// be relaunched without resetting the semaphore.
///
/// Runtime args: `address value`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SemaphoreDrain;

impl Kernel for SemaphoreDrain {
    fn name(&self) -> &str {
        "semaphore_drain"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let (address, value) = (ctx.arg(0)?, ctx.arg(1)?);
        ctx.semaphore_wait_min(address, value)?;
        ctx.noc_semaphore_inc(ctx.noc_core(), address, value.wrapping_neg())?;
        Ok(())
    }
}

/// Add one to a local L1 word.
///
/// Common args: `address`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter;

impl Kernel for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let address = ctx.common_arg(0)?;
        let value = ctx.read_u32(address)?;
        ctx.write_u32(address, value.wrapping_add(1))
    }
}

/// Busy the core for a while.
///
/// Common args: `micros`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Spin;

impl Kernel for Spin {
    fn name(&self) -> &str {
        "spin"
    }

    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        std::thread::sleep(Duration::from_micros(u64::from(ctx.common_arg(0)?)));
        Ok(())
    }
}

/// Program running [`Counter`] on `cores`, bumping the word at `address`.
///
/// # Errors
///
/// Returns error for an empty core set.
pub fn counter_program(name: &str, cores: impl Into<CoreRangeSet>, address: u32) -> Result<Program> {
    let mut program = Program::new(name);
    let handle = program.add_kernel(Arc::new(Counter), cores, KernelConfig::tensix())?;
    program.set_common_runtime_args(handle, vec![address])?;
    Ok(program)
}

/// Program whose [`SyncAndIncrement`] on `core` waits for the host to set
/// the semaphore at `semaphore` to 1, then bumps the same semaphore on
/// `target`.
///
/// # Errors
///
/// Returns error if the kernel cannot be placed.
pub fn host_sync_program(core: CoreCoord, semaphore: u32, target: CoreCoord) -> Result<Program> {
    let mut program = Program::new("host_sync");
    let handle = program.add_kernel(Arc::new(SyncAndIncrement), core, KernelConfig::tensix())?;
    program.set_runtime_args(handle, core, vec![semaphore, 1, target.x, target.y, semaphore])?;
    Ok(program)
}

/// Program copying every page of `src` into `dst` on `core` once the
/// semaphore at `semaphore` reaches 1, adding `add` to each u32 word and
/// then bumping the same semaphore on `notify`, if given.
///
/// # Errors
///
/// Returns error if the buffers disagree on page count or the kernel
/// cannot be placed.
pub fn gated_copy_program(
    core: CoreCoord,
    src: &MeshBuffer,
    dst: &MeshBuffer,
    semaphore: u32,
    add: u32,
    notify: Option<CoreCoord>,
) -> Result<Program> {
    let num_pages = dst.num_pages();
    if src.num_pages() != num_pages {
        return Err(TesselError::kernel_argument(format!(
            "copy from {} pages into {num_pages}",
            src.num_pages()
        )));
    }
    let mut program = Program::new(if add == 0 { "datacopy" } else { "sync_and_add" });
    let handle = program.add_kernel(Arc::new(DataCopy), core, KernelConfig::tensix())?;
    let mut args = Vec::with_capacity(13);
    args.extend(src.interleaved().to_args());
    args.extend(dst.interleaved().to_args());
    args.extend([0, num_pages, semaphore, 1, add]);
    if let Some(n) = notify {
        args.extend([n.x, n.y]);
    }
    program.set_runtime_args(handle, core, args)?;
    Ok(program)
}

/// Programs of a host/sub-device handshake.
///
/// The waiter blocks on its core until every incrementer core has bumped its
/// semaphore; the syncer counts its own launches in the word after the
/// semaphore. Waiter and incrementers are meant for different sub-devices.
#[derive(Debug)]
pub struct SyncPrograms {
    /// [`SemaphoreDrain`] on the waiter core
    pub waiter: Program,
    /// [`Counter`] on the syncer core, at `semaphore + 4`
    pub syncer: Program,
    /// [`SemaphoreIncrement`] of the waiter's semaphore from every core
    pub incrementer: Program,
}

/// Build [`SyncPrograms`] around the semaphore word at `semaphore`.
///
/// # Errors
///
/// Returns error if a kernel cannot be placed.
pub fn sync_programs(
    waiter: CoreCoord,
    syncer: CoreCoord,
    incrementers: impl Into<CoreRangeSet>,
    semaphore: u32,
) -> Result<SyncPrograms> {
    let incrementers = incrementers.into();
    let num_incrementers = incrementers.num_cores() as u32;

    let mut waiter_program = Program::new("waiter");
    let handle = waiter_program.add_kernel(Arc::new(SemaphoreDrain), waiter, KernelConfig::tensix())?;
    waiter_program.set_runtime_args(handle, waiter, vec![semaphore, num_incrementers])?;

    let syncer_program = counter_program("syncer", syncer, semaphore + 4)?;

    let mut incrementer = Program::new("incrementer");
    let handle = incrementer.add_kernel(
        Arc::new(SemaphoreIncrement),
        incrementers.clone(),
        KernelConfig::tensix(),
    )?;
    for core in incrementers.iter() {
        incrementer.set_runtime_args(handle, core, vec![waiter.x, waiter.y, semaphore, 1])?;
    }

    Ok(SyncPrograms {
        waiter: waiter_program,
        syncer: syncer_program,
        incrementer,
    })
}

/// Seeded random [`Counter`] programs, each on a random rectangle of the
/// worker grid, optionally followed by a [`Spin`] on ethernet core 0 so
/// launches overlap.
///
/// # Errors
///
/// Returns error if a kernel cannot be placed.
pub fn random_programs(rng: &mut impl Rng, chip: &ChipSpec, count: usize, address: u32) -> Result<Vec<Program>> {
    (0..count)
        .map(|i| {
            let x0 = rng.gen_range(0..chip.grid_x);
            let y0 = rng.gen_range(0..chip.grid_y);
            let x1 = rng.gen_range(x0..chip.grid_x);
            let y1 = rng.gen_range(y0..chip.grid_y);
            let cores = CoreRange::new(CoreCoord::new(x0, y0), CoreCoord::new(x1, y1));
            let mut program = counter_program(&format!("random_{i}"), cores, address)?;
            if rng.gen_bool(0.25) {
                let spin = program.add_kernel(
                    Arc::new(Spin),
                    CoreCoord::new(0, 0),
                    KernelConfig::ethernet(),
                )?;
                program.set_common_runtime_args(spin, vec![rng.gen_range(10..200)])?;
            }
            Ok(program)
        })
        .collect()
}
