//! Programs, kernels and the per-core execution context
//!
//! A [`Program`] binds kernels to core range sets on one chip, with
//! compile-time args, per-core and common runtime args, and program-local
//! semaphores. [`compile`] checks it against a device and produces the
//! loadable [`CompiledProgram`]. Runtime args are kept apart from the
//! compiled image so re-enqueues only push args that changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tessel_chip::chip::MAX_PROGRAM_SEMAPHORES;
use tessel_chip::{ChipSpec, CoreCoord, CoreRangeSet, CoreType, NocCommand};
use tracing::debug;

use crate::buffer::InterleavedBuffer;
use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::fabric::{EdmEndpoint, FabricConnection};
use crate::system::PhysicalDeviceId;

/// Code that runs on one core.
///
/// Kernels are stateless; everything a launch needs arrives through the
/// [`KernelContext`].
pub trait Kernel: fmt::Debug + Send + Sync {
    /// Name used in logs and fault reports.
    fn name(&self) -> &str;

    /// Run to completion on one core.
    ///
    /// # Errors
    ///
    /// Any error becomes a device fault.
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

/// Where and how a kernel is placed.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Core type the kernel runs on
    pub core_type: CoreType,
    /// Compile-time args
    pub compile_args: Vec<u32>,
}

impl KernelConfig {
    /// Worker-core kernel.
    pub const fn tensix() -> Self {
        Self {
            core_type: CoreType::Tensix,
            compile_args: Vec::new(),
        }
    }

    /// Ethernet-core kernel.
    pub const fn ethernet() -> Self {
        Self {
            core_type: CoreType::Ethernet,
            compile_args: Vec::new(),
        }
    }

    /// Set compile-time args.
    #[must_use]
    pub fn with_compile_args(mut self, args: Vec<u32>) -> Self {
        self.compile_args = args;
        self
    }
}

/// Index of a kernel within its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(usize);

#[derive(Debug, Clone)]
struct KernelGroup {
    kernel: Arc<dyn Kernel>,
    cores: CoreRangeSet,
    config: KernelConfig,
}

#[derive(Debug, Clone, Default)]
struct KernelArgs {
    per_core: HashMap<CoreCoord, Vec<u32>>,
    common: Vec<u32>,
}

/// Snapshot of a program's runtime args.
#[derive(Debug, Clone, Default)]
pub(crate) struct RuntimeArgs {
    per_kernel: Vec<KernelArgs>,
}

impl RuntimeArgs {
    fn core_args(&self, kernel: usize, core: CoreCoord) -> &[u32] {
        self.per_kernel
            .get(kernel)
            .and_then(|k| k.per_core.get(&core))
            .map_or(&[], Vec::as_slice)
    }

    fn common_args(&self, kernel: usize) -> &[u32] {
        self.per_kernel.get(kernel).map_or(&[], |k| k.common.as_slice())
    }

    /// Serialized size, used for trace accounting.
    pub(crate) fn encoded_len(&self) -> usize {
        self.per_kernel
            .iter()
            .map(|k| 4 * (k.common.len() + k.per_core.values().map(|a| a.len() + 1).sum::<usize>()))
            .sum()
    }
}

#[derive(Debug, Clone)]
struct ProgramSemaphore {
    cores: CoreRangeSet,
    core_type: CoreType,
    initial: u32,
}

/// Kernels bound to cores on one chip.
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    kernels: Vec<KernelGroup>,
    semaphores: Vec<ProgramSemaphore>,
    args: RuntimeArgs,
    args_version: u64,
}

impl Program {
    /// Empty program.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: Vec::new(),
            semaphores: Vec::new(),
            args: RuntimeArgs::default(),
            args_version: 0,
        }
    }

    /// Program name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Place `kernel` on `cores`.
    ///
    /// # Errors
    ///
    /// Returns `Overlap` if another kernel of the same core type already
    /// owns one of the cores, or `InvalidState` for an empty core set.
    pub fn add_kernel(
        &mut self,
        kernel: Arc<dyn Kernel>,
        cores: impl Into<CoreRangeSet>,
        config: KernelConfig,
    ) -> Result<KernelHandle> {
        let cores = cores.into();
        if cores.is_empty() {
            return Err(TesselError::invalid_state(format!(
                "kernel {} placed on no cores",
                kernel.name()
            )));
        }
        if let Some(other) = self
            .kernels
            .iter()
            .find(|k| k.config.core_type == config.core_type && k.cores.intersects(&cores))
        {
            return Err(TesselError::overlap(format!(
                "kernel {} shares cores with kernel {} in program {}",
                kernel.name(),
                other.kernel.name(),
                self.name
            )));
        }
        self.kernels.push(KernelGroup { kernel, cores, config });
        self.args.per_kernel.push(KernelArgs::default());
        Ok(KernelHandle(self.kernels.len() - 1))
    }

    /// Add a program-local semaphore, returning its index.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` past the per-program semaphore limit.
    pub fn create_semaphore(
        &mut self,
        cores: impl Into<CoreRangeSet>,
        core_type: CoreType,
        initial: u32,
    ) -> Result<u32> {
        if self.semaphores.len() as u32 >= MAX_PROGRAM_SEMAPHORES {
            return Err(TesselError::out_of_memory(format!(
                "program {} exceeds {MAX_PROGRAM_SEMAPHORES} semaphores",
                self.name
            )));
        }
        self.semaphores.push(ProgramSemaphore {
            cores: cores.into(),
            core_type,
            initial,
        });
        Ok(self.semaphores.len() as u32 - 1)
    }

    fn group(&self, handle: KernelHandle) -> Result<&KernelGroup> {
        self.kernels.get(handle.0).ok_or_else(|| {
            TesselError::invalid_state(format!("program {} has no kernel {}", self.name, handle.0))
        })
    }

    /// Set runtime args for one core.
    ///
    /// # Errors
    ///
    /// Returns error if the kernel does not run on `core`.
    pub fn set_runtime_args(&mut self, handle: KernelHandle, core: CoreCoord, args: Vec<u32>) -> Result<()> {
        let group = self.group(handle)?;
        if !group.cores.contains(core) {
            return Err(TesselError::kernel_argument(format!(
                "kernel {} does not run on core {core}",
                group.kernel.name()
            )));
        }
        let slot = &mut self.args.per_kernel[handle.0].per_core;
        if slot.get(&core) != Some(&args) {
            slot.insert(core, args);
            self.args_version += 1;
        }
        Ok(())
    }

    /// Set args shared by every core of a kernel.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown kernel handle.
    pub fn set_common_runtime_args(&mut self, handle: KernelHandle, args: Vec<u32>) -> Result<()> {
        self.group(handle)?;
        let slot = &mut self.args.per_kernel[handle.0].common;
        if *slot != args {
            *slot = args;
            self.args_version += 1;
        }
        Ok(())
    }

    /// Runtime args of one core, if set.
    #[must_use]
    pub fn runtime_args(&self, handle: KernelHandle, core: CoreCoord) -> Option<&[u32]> {
        self.args
            .per_kernel
            .get(handle.0)?
            .per_core
            .get(&core)
            .map(Vec::as_slice)
    }

    /// Union of cores used by kernels of `core_type`.
    #[must_use]
    pub fn cores(&self, core_type: CoreType) -> CoreRangeSet {
        self.kernels
            .iter()
            .filter(|k| k.config.core_type == core_type)
            .fold(CoreRangeSet::empty(), |acc, k| acc.merge(&k.cores))
    }

    pub(crate) const fn args_version(&self) -> u64 {
        self.args_version
    }

    pub(crate) fn snapshot_args(&self) -> Arc<RuntimeArgs> {
        Arc::new(self.args.clone())
    }
}

#[derive(Debug)]
struct CompiledKernel {
    kernel: Arc<dyn Kernel>,
    core_type: CoreType,
    cores: Vec<CoreCoord>,
    compile_args: Vec<u32>,
}

#[derive(Debug)]
struct CompiledSemaphore {
    address: u32,
    initial: u32,
    nocs: Vec<CoreCoord>,
}

/// Program checked against and loaded for one device.
#[derive(Debug)]
pub struct CompiledProgram {
    name: String,
    device: PhysicalDeviceId,
    kernels: Vec<CompiledKernel>,
    semaphores: Vec<CompiledSemaphore>,
}

impl CompiledProgram {
    /// Program name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the program was compiled for.
    #[must_use]
    pub const fn device(&self) -> PhysicalDeviceId {
        self.device
    }

    /// Number of (kernel, core) placements.
    #[must_use]
    pub fn num_placements(&self) -> usize {
        self.kernels.iter().map(|k| k.cores.len()).sum()
    }
}

/// Compile `program` for `device`.
///
/// # Errors
///
/// Returns `TooManyCores` if a kernel or semaphore names a core the chip
/// does not have.
pub fn compile(device: &Device, program: &Program) -> Result<CompiledProgram> {
    let chip = device.chip();
    let check = |core_type: CoreType, cores: &CoreRangeSet, what: &str| -> Result<Vec<CoreCoord>> {
        let cores: Vec<CoreCoord> = cores.iter().collect();
        if let Some(bad) = cores.iter().find(|c| !chip.has_core(core_type, **c)) {
            return Err(TesselError::too_many_cores(format!(
                "{what} in program {} uses {core_type:?} core {bad}, not on device {}",
                program.name,
                device.id()
            )));
        }
        Ok(cores)
    };

    let kernels = program
        .kernels
        .iter()
        .map(|k| {
            Ok(CompiledKernel {
                kernel: Arc::clone(&k.kernel),
                core_type: k.config.core_type,
                cores: check(k.config.core_type, &k.cores, k.kernel.name())?,
                compile_args: k.config.compile_args.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let semaphores = program
        .semaphores
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let nocs = check(s.core_type, &s.cores, "semaphore")?
                .into_iter()
                .map(|c| chip.noc_coord(s.core_type, c))
                .collect();
            Ok(CompiledSemaphore {
                address: ChipSpec::semaphore_address(i as u32),
                initial: s.initial,
                nocs,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "Compiled program {} for device {}: {} kernel(s), {} semaphore(s)",
        program.name,
        device.id(),
        kernels.len(),
        semaphores.len()
    );

    Ok(CompiledProgram {
        name: program.name.clone(),
        device: device.id(),
        kernels,
        semaphores,
    })
}

/// Compiled program plus the runtime args to launch it with.
#[derive(Debug, Clone)]
pub(crate) struct LaunchMessage {
    pub(crate) program: Arc<CompiledProgram>,
    pub(crate) args: Arc<RuntimeArgs>,
}

/// Run one launch on `device`: initialise semaphores, then every placement
/// concurrently. Returns the first kernel error.
pub(crate) fn execute(device: &Device, launch: &LaunchMessage, timeout: Duration) -> Result<()> {
    let program = &launch.program;
    let semaphore_addrs: Vec<u32> = program.semaphores.iter().map(|s| s.address).collect();
    for sem in &program.semaphores {
        for noc in &sem.nocs {
            device.write_l1_u32(*noc, sem.address, sem.initial)?;
        }
    }

    let placements: Vec<(usize, CoreCoord)> = program
        .kernels
        .iter()
        .enumerate()
        .flat_map(|(i, k)| k.cores.iter().map(move |c| (i, *c)))
        .collect();

    let run_one = |(index, core): (usize, CoreCoord)| -> Result<()> {
        let k = &program.kernels[index];
        let mut ctx = KernelContext {
            device,
            core_type: k.core_type,
            core,
            noc: device.noc(k.core_type, core),
            compile_args: &k.compile_args,
            runtime_args: launch.args.core_args(index, core),
            common_args: launch.args.common_args(index),
            semaphores: &semaphore_addrs,
            timeout,
        };
        k.kernel.run(&mut ctx).map_err(|e| {
            TesselError::invalid_state(format!(
                "kernel {} on {:?} core {core} of program {}: {e}",
                k.kernel.name(),
                k.core_type,
                program.name
            ))
        })
    };

    if placements.len() == 1 {
        return run_one(placements[0]);
    }

    std::thread::scope(|s| {
        let handles: Vec<_> = placements
            .iter()
            .map(|&p| s.spawn(move || run_one(p)))
            .collect();
        let mut first = Ok(());
        for h in handles {
            let outcome = h
                .join()
                .unwrap_or_else(|_| Err(TesselError::invalid_state("kernel thread panicked")));
            if first.is_ok() {
                first = outcome;
            }
        }
        first
    })
}

/// Everything a kernel can see and touch while it runs on one core.
#[derive(Debug)]
pub struct KernelContext<'a> {
    device: &'a Device,
    core_type: CoreType,
    core: CoreCoord,
    noc: CoreCoord,
    compile_args: &'a [u32],
    runtime_args: &'a [u32],
    common_args: &'a [u32],
    semaphores: &'a [u32],
    timeout: Duration,
}

impl<'a> KernelContext<'a> {
    /// Device the kernel runs on.
    #[must_use]
    pub fn device_id(&self) -> PhysicalDeviceId {
        self.device.id()
    }

    pub(crate) const fn device(&self) -> &'a Device {
        self.device
    }

    /// Logical core.
    #[must_use]
    pub const fn core(&self) -> CoreCoord {
        self.core
    }

    /// Core type.
    #[must_use]
    pub const fn core_type(&self) -> CoreType {
        self.core_type
    }

    /// NOC coordinate of this core.
    #[must_use]
    pub const fn noc_core(&self) -> CoreCoord {
        self.noc
    }

    /// NOC coordinate of a logical worker core on this chip.
    #[must_use]
    pub const fn worker_noc(&self, logical: CoreCoord) -> CoreCoord {
        self.device.noc(CoreType::Tensix, logical)
    }

    /// Device-side wait budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Per-core runtime args.
    #[must_use]
    pub const fn args(&self) -> &[u32] {
        self.runtime_args
    }

    /// Runtime arg `index`.
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if the arg was not set.
    pub fn arg(&self, index: usize) -> Result<u32> {
        self.runtime_args.get(index).copied().ok_or_else(|| {
            TesselError::kernel_argument(format!(
                "runtime arg {index} missing on core {} ({} set)",
                self.core,
                self.runtime_args.len()
            ))
        })
    }

    /// Common runtime arg `index`.
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if the arg was not set.
    pub fn common_arg(&self, index: usize) -> Result<u32> {
        self.common_args.get(index).copied().ok_or_else(|| {
            TesselError::kernel_argument(format!("common runtime arg {index} missing"))
        })
    }

    /// Compile-time arg `index`.
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if the arg was not set.
    pub fn compile_arg(&self, index: usize) -> Result<u32> {
        self.compile_args.get(index).copied().ok_or_else(|| {
            TesselError::kernel_argument(format!("compile arg {index} missing"))
        })
    }

    /// L1 address of program semaphore `index`.
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` for an unknown semaphore.
    pub fn semaphore_address(&self, index: u32) -> Result<u32> {
        self.semaphores.get(index as usize).copied().ok_or_else(|| {
            TesselError::kernel_argument(format!("program semaphore {index} not created"))
        })
    }

    /// Read local L1.
    ///
    /// # Errors
    ///
    /// Returns error if the access leaves L1.
    pub fn read_l1(&self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.device.read_l1(self.noc, address, len)
    }

    /// Write local L1.
    ///
    /// # Errors
    ///
    /// Returns error if the access leaves L1.
    pub fn write_l1(&self, address: u32, data: &[u8]) -> Result<()> {
        self.device.write_l1(self.noc, address, data)
    }

    /// Read a local L1 word.
    ///
    /// # Errors
    ///
    /// Returns error if the access leaves L1.
    pub fn read_u32(&self, address: u32) -> Result<u32> {
        self.device.read_l1_u32(self.noc, address)
    }

    /// Write a local L1 word.
    ///
    /// # Errors
    ///
    /// Returns error if the access leaves L1.
    pub fn write_u32(&self, address: u32, value: u32) -> Result<()> {
        self.device.write_l1_u32(self.noc, address, value)
    }

    /// Wait until a local semaphore equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` after the dispatch timeout.
    pub fn semaphore_wait(&self, address: u32, value: u32) -> Result<u32> {
        self.device
            .wait_l1_u32(self.noc, address, self.timeout, |v| v == value)
    }

    /// Wait until a local semaphore is at least `value`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` after the dispatch timeout.
    pub fn semaphore_wait_min(&self, address: u32, value: u32) -> Result<u32> {
        self.device
            .wait_l1_u32(self.noc, address, self.timeout, |v| v >= value)
    }

    /// Set a local semaphore.
    ///
    /// # Errors
    ///
    /// Returns error if the access leaves L1.
    pub fn semaphore_set(&self, address: u32, value: u32) -> Result<()> {
        self.write_u32(address, value)
    }

    /// Atomically increment a semaphore on any core of this chip.
    ///
    /// # Errors
    ///
    /// Returns error if `noc` is not a core.
    pub fn noc_semaphore_inc(&self, noc: CoreCoord, address: u32, value: u32) -> Result<u32> {
        self.device.atomic_inc(noc, address, value)
    }

    /// Write L1 of any core on this chip.
    ///
    /// # Errors
    ///
    /// Returns error if `noc` is not a core.
    pub fn noc_write(&self, noc: CoreCoord, address: u32, data: &[u8]) -> Result<()> {
        self.device.write_l1(noc, address, data)
    }

    /// Apply a NOC command on this chip.
    pub(crate) fn apply(&self, command: &NocCommand) -> Result<()> {
        match command {
            NocCommand::UnicastWrite { noc_x, noc_y, address, payload } => {
                self.noc_write(CoreCoord::new(*noc_x, *noc_y), *address, payload)
            }
            NocCommand::AtomicInc { noc_x, noc_y, address, value } => self
                .noc_semaphore_inc(CoreCoord::new(*noc_x, *noc_y), *address, *value)
                .map(|_| ()),
        }
    }

    /// Read one page of an interleaved buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the page lies outside device memory.
    pub fn read_page(&self, buffer: &InterleavedBuffer, page: u32) -> Result<Vec<u8>> {
        buffer.locate(self.device.chip(), page).read(self.device, buffer.page_size as usize)
    }

    /// Write one page of an interleaved buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the page lies outside device memory.
    pub fn write_page(&self, buffer: &InterleavedBuffer, page: u32, data: &[u8]) -> Result<()> {
        buffer.locate(self.device.chip(), page).write(self.device, data)
    }

    /// Reopen a fabric connection from its runtime-arg encoding.
    ///
    /// Returns `None` when the args encode "no connection".
    ///
    /// # Errors
    ///
    /// Returns `KernelArgument` if the args are short or name no EDM.
    pub fn fabric_connection(&self, args: &[u32]) -> Result<Option<FabricConnection>> {
        FabricConnection::from_args(self.device, args, self.timeout)
    }

    /// EDM endpoint living on this ethernet core.
    pub(crate) fn edm_endpoint(&self) -> Result<Arc<EdmEndpoint>> {
        self.device.edm_at(self.core).ok_or_else(|| {
            TesselError::fabric(format!(
                "no EDM registered on device {} ethernet core {}",
                self.device.id(),
                self.core
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_chip::CoreRange;

    #[derive(Debug)]
    struct Noop;

    impl Kernel for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(&self, _ctx: &mut KernelContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn overlapping_kernels_rejected() {
        let mut p = Program::new("p");
        let grid = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1));
        p.add_kernel(Arc::new(Noop), grid, KernelConfig::tensix()).unwrap();
        let err = p
            .add_kernel(Arc::new(Noop), CoreCoord::new(1, 1), KernelConfig::tensix())
            .unwrap_err();
        assert!(matches!(err, TesselError::Overlap { .. }));
        p.add_kernel(Arc::new(Noop), CoreCoord::new(1, 0), KernelConfig::ethernet())
            .unwrap();
    }

    #[test]
    fn args_version_tracks_changes_only() {
        let mut p = Program::new("p");
        let k = p
            .add_kernel(Arc::new(Noop), CoreCoord::new(0, 0), KernelConfig::tensix())
            .unwrap();
        p.set_runtime_args(k, CoreCoord::new(0, 0), vec![1, 2]).unwrap();
        let v = p.args_version();
        p.set_runtime_args(k, CoreCoord::new(0, 0), vec![1, 2]).unwrap();
        assert_eq!(p.args_version(), v);
        p.set_runtime_args(k, CoreCoord::new(0, 0), vec![3]).unwrap();
        assert_eq!(p.args_version(), v + 1);
        assert!(p.set_runtime_args(k, CoreCoord::new(5, 5), vec![]).is_err());
    }

    #[test]
    fn compile_rejects_missing_cores() {
        let dev = Device::new(PhysicalDeviceId(0), ChipSpec::WORMHOLE);
        let mut p = Program::new("p");
        p.add_kernel(Arc::new(Noop), CoreCoord::new(8, 0), KernelConfig::tensix())
            .unwrap();
        assert!(matches!(
            compile(&dev, &p).unwrap_err(),
            TesselError::TooManyCores { .. }
        ));
    }
}
