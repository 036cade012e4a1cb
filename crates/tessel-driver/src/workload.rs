//! Mesh workloads
//!
//! A [`MeshWorkload`] binds programs to rectangular sub-grids of a mesh.
//! Bindings are frozen by the first enqueue; runtime args stay mutable and
//! only programs whose args changed are re-pushed. Compiled images are
//! cached by physical device id, so a reshape never forces a recompile.

use std::collections::HashMap;
use std::sync::Arc;

use tessel_chip::{CoreCoord, LogicalDeviceRange, MeshCoordinate, MeshShape};
use tracing::debug;

use crate::device::Device;
use crate::error::{Result, TesselError};
use crate::program::{self, CompiledProgram, KernelHandle, LaunchMessage, Program, RuntimeArgs};
use crate::sub_device::SubDeviceManager;
use crate::system::PhysicalDeviceId;

#[derive(Debug)]
struct Binding {
    program: Program,
    range: LogicalDeviceRange,
    compiled: HashMap<PhysicalDeviceId, Arc<CompiledProgram>>,
    pushed: Option<(u64, Arc<RuntimeArgs>)>,
}

impl Binding {
    /// Current args, re-snapshotted only if they changed since the last push.
    fn args(&mut self, pushes: &mut u64) -> Arc<RuntimeArgs> {
        let version = self.program.args_version();
        match &self.pushed {
            Some((pushed, args)) if *pushed == version => Arc::clone(args),
            _ => {
                let args = self.program.snapshot_args();
                self.pushed = Some((version, Arc::clone(&args)));
                *pushes += 1;
                args
            }
        }
    }
}

/// One launch a workload resolves to.
#[derive(Debug)]
pub(crate) struct PlannedLaunch {
    pub(crate) device: Arc<Device>,
    pub(crate) lane: usize,
    pub(crate) launch: LaunchMessage,
}

/// Programs bound to sub-grids of a mesh, enqueued as one unit.
#[derive(Debug, Default)]
pub struct MeshWorkload {
    bindings: Vec<Binding>,
    frozen: bool,
    runtime_arg_pushes: u64,
}

impl MeshWorkload {
    /// Empty workload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `program` to every device in `range`, returning its index.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the workload has been enqueued, and
    /// `Overlap` if `range` intersects a range already bound.
    pub fn add_program(&mut self, program: Program, range: LogicalDeviceRange) -> Result<usize> {
        if self.frozen {
            return Err(TesselError::invalid_state(format!(
                "cannot add program {} to a workload that has been enqueued",
                program.name()
            )));
        }
        if let Some(other) = self.bindings.iter().find(|b| b.range.intersects(&range)) {
            return Err(TesselError::overlap(format!(
                "range {range} of program {} overlaps range {} of program {}",
                program.name(),
                other.range,
                other.program.name()
            )));
        }
        self.bindings.push(Binding {
            program,
            range,
            compiled: HashMap::new(),
            pushed: None,
        });
        Ok(self.bindings.len() - 1)
    }

    /// Number of bound programs.
    #[must_use]
    pub fn num_programs(&self) -> usize {
        self.bindings.len()
    }

    /// Bound program `index`.
    #[must_use]
    pub fn program(&self, index: usize) -> Option<&Program> {
        self.bindings.get(index).map(|b| &b.program)
    }

    /// Device range of program `index`.
    #[must_use]
    pub fn range(&self, index: usize) -> Option<LogicalDeviceRange> {
        self.bindings.get(index).map(|b| b.range)
    }

    fn binding_mut(&mut self, index: usize) -> Result<&mut Binding> {
        let count = self.bindings.len();
        self.bindings.get_mut(index).ok_or_else(|| {
            TesselError::invalid_state(format!("workload has {count} program(s), no index {index}"))
        })
    }

    /// Update per-core runtime args of a bound program.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown program or kernel, or a core the kernel
    /// does not run on.
    pub fn set_runtime_args(
        &mut self,
        index: usize,
        kernel: KernelHandle,
        core: CoreCoord,
        args: Vec<u32>,
    ) -> Result<()> {
        self.binding_mut(index)?
            .program
            .set_runtime_args(kernel, core, args)
    }

    /// Update common runtime args of a bound program.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown program or kernel.
    pub fn set_common_runtime_args(&mut self, index: usize, kernel: KernelHandle, args: Vec<u32>) -> Result<()> {
        self.binding_mut(index)?
            .program
            .set_common_runtime_args(kernel, args)
    }

    /// Whether the bindings are frozen.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// How many runtime-arg snapshots have been pushed to devices.
    #[must_use]
    pub const fn runtime_arg_pushes(&self) -> u64 {
        self.runtime_arg_pushes
    }

    /// Resolve every binding to per-device launches.
    ///
    /// Ranges are validated against `shape` before anything is compiled, so
    /// a bad range leaves the workload untouched.
    pub(crate) fn plan(
        &mut self,
        shape: MeshShape,
        device_at: impl Fn(MeshCoordinate) -> Option<Arc<Device>>,
        manager: &SubDeviceManager,
    ) -> Result<Vec<PlannedLaunch>> {
        if let Some(bad) = self.bindings.iter().find(|b| !b.range.fits_within(shape)) {
            return Err(TesselError::invalid_range(format!(
                "range {} of program {} does not fit mesh {shape}",
                bad.range,
                bad.program.name()
            )));
        }
        let lanes = self
            .bindings
            .iter()
            .map(|b| manager.sub_device_for(&b.program))
            .collect::<Result<Vec<_>>>()?;

        let mut planned = Vec::new();
        let mut pushes = self.runtime_arg_pushes;
        for (binding, lane) in self.bindings.iter_mut().zip(lanes) {
            let args = binding.args(&mut pushes);
            for coord in binding.range.iter() {
                let device = device_at(coord).ok_or_else(|| {
                    TesselError::invalid_range(format!("no device at {coord} in mesh {shape}"))
                })?;
                let compiled = match binding.compiled.get(&device.id()) {
                    Some(c) => Arc::clone(c),
                    None => {
                        let c = Arc::new(program::compile(&device, &binding.program)?);
                        binding.compiled.insert(device.id(), Arc::clone(&c));
                        c
                    }
                };
                planned.push(PlannedLaunch {
                    device,
                    lane: lane.lane(),
                    launch: LaunchMessage {
                        program: compiled,
                        args: Arc::clone(&args),
                    },
                });
            }
        }
        self.runtime_arg_pushes = pushes;
        self.frozen = true;
        debug!(
            "Workload resolved to {} launch(es) over {} program(s)",
            planned.len(),
            self.bindings.len()
        );
        Ok(planned)
    }
}
