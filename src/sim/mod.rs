//! A sequential reference executor for lowered programs.
//!
//! Groups run one after another. Inside a group, every statement is executed by all active
//! threads before the next statement starts, so barriers are implicit and the in-wave steps of
//! the group algorithms behave as on lockstep hardware. The order in which threads take their
//! turn within a statement is set by [`Schedule`]; atomics observe that order.
//!
//! Lockstep execution hides missing barriers between waves. [`Device::with_race_check`] makes
//! such code fail instead: two different waves touching one location between the same pair of
//! barriers, at least one of them writing, is reported as [`SimError::DataRace`].

mod eval;
mod group;

pub use eval::eval;

use crate::ir::{KernelUse, PrimType, PrimValue, Program, VName};
use group::{GroupRun, RaceCheck};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum SimError {
    #[error("unknown variable `{0}`")]
    UnknownVariable(VName),
    #[error("unknown array `{0}`")]
    UnknownArray(VName),
    #[error("index {index} out of bounds for `{array}` of length {len}")]
    OutOfBounds { array: VName, index: i64, len: usize },
    #[error("type mismatch: {what}")]
    TypeMismatch { what: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("kernel uses `{0}`, which the host did not provide")]
    UnboundUse(VName),
    #[error("kernel `{kernel}` launched with {num_groups} groups of {group_size} threads")]
    InvalidLaunch {
        kernel: String,
        num_groups: i64,
        group_size: i64,
    },
    #[error("loop did not terminate")]
    LoopLimit,
    #[error("waves {first} and {second} access `{array}[{index}]` between the same barriers")]
    DataRace {
        array: VName,
        index: i64,
        first: i64,
        second: i64,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Schedule {
    Forward,
    Reverse,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LaunchStats {
    pub kernels: usize,
    pub barriers: u64,
    pub atomics: u64,
}

#[derive(Clone, PartialEq, Debug)]
pub(crate) struct Buffer {
    pub ty: PrimType,
    pub bits: Vec<u64>,
}

impl Buffer {
    pub fn zeroed(ty: PrimType, len: usize) -> Self {
        Buffer {
            ty,
            bits: vec![0; len],
        }
    }
}

pub struct Device {
    wave_size: i64,
    schedule: Schedule,
    max_loop_iterations: u64,
    race_check: bool,
    scalars: HashMap<VName, PrimValue>,
    global: HashMap<VName, Buffer>,
}

impl Device {
    pub fn new(wave_size: i64) -> Self {
        Device {
            wave_size,
            schedule: Schedule::Forward,
            max_loop_iterations: 1 << 20,
            race_check: false,
            scalars: HashMap::new(),
            global: HashMap::new(),
        }
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_max_loop_iterations(mut self, limit: u64) -> Self {
        self.max_loop_iterations = limit;
        self
    }

    pub fn with_race_check(mut self) -> Self {
        self.race_check = true;
        self
    }

    pub fn bind_scalar(&mut self, name: &str, value: PrimValue) {
        self.scalars.insert(VName::new(name), value);
    }

    pub fn upload(
        &mut self,
        name: &str,
        ty: PrimType,
        values: &[PrimValue],
    ) -> Result<(), SimError> {
        if let Some(bad) = values.iter().find(|v| v.ty() != ty) {
            return Err(SimError::TypeMismatch {
                what: format!("uploading {} into an array of {}", bad.ty(), ty),
            });
        }
        let bits = values.iter().map(PrimValue::to_bits).collect();
        self.global.insert(VName::new(name), Buffer { ty, bits });
        Ok(())
    }

    pub fn upload_i32(&mut self, name: &str, values: &[i32]) {
        let bits = values.iter().map(|v| PrimValue::I32(*v).to_bits()).collect();
        self.global.insert(
            VName::new(name),
            Buffer {
                ty: PrimType::I32,
                bits,
            },
        );
    }

    pub fn upload_i64(&mut self, name: &str, values: &[i64]) {
        let bits = values.iter().map(|v| PrimValue::I64(*v).to_bits()).collect();
        self.global.insert(
            VName::new(name),
            Buffer {
                ty: PrimType::I64,
                bits,
            },
        );
    }

    pub fn upload_f32(&mut self, name: &str, values: &[f32]) {
        let bits = values.iter().map(|v| PrimValue::F32(*v).to_bits()).collect();
        self.global.insert(
            VName::new(name),
            Buffer {
                ty: PrimType::F32,
                bits,
            },
        );
    }

    pub fn download(&self, name: &str) -> Result<Vec<PrimValue>, SimError> {
        let buf = self
            .global
            .get(&VName::new(name))
            .ok_or_else(|| SimError::UnknownArray(VName::new(name)))?;
        Ok(buf
            .bits
            .iter()
            .map(|b| PrimValue::from_bits(buf.ty, *b))
            .collect())
    }

    fn download_as<T>(
        &self,
        name: &str,
        ty: PrimType,
        extract: impl Fn(PrimValue) -> Option<T>,
    ) -> Result<Vec<T>, SimError> {
        self.download(name)?
            .into_iter()
            .map(|v| {
                extract(v).ok_or_else(|| SimError::TypeMismatch {
                    what: format!("downloading `{}` of {} as {}", name, v.ty(), ty),
                })
            })
            .collect()
    }

    pub fn download_i32(&self, name: &str) -> Result<Vec<i32>, SimError> {
        self.download_as(name, PrimType::I32, |v| match v {
            PrimValue::I32(x) => Some(x),
            _ => None,
        })
    }

    pub fn download_i64(&self, name: &str) -> Result<Vec<i64>, SimError> {
        self.download_as(name, PrimType::I64, |v| match v {
            PrimValue::I64(x) => Some(x),
            _ => None,
        })
    }

    pub fn download_f32(&self, name: &str) -> Result<Vec<f32>, SimError> {
        self.download_as(name, PrimType::F32, |v| match v {
            PrimValue::F32(x) => Some(x),
            _ => None,
        })
    }

    fn host_env(&self, program: &Program) -> HashMap<VName, PrimValue> {
        let mut env = self.scalars.clone();
        for param in &program.tuning_params {
            env.entry(param.name.clone())
                .or_insert(PrimValue::I64(param.default));
        }
        for kernel in &program.kernels {
            for u in &kernel.uses {
                if let KernelUse::Constant(name, v) = u {
                    env.insert(name.clone(), *v);
                }
            }
        }
        env
    }

    /// Allocates the program's arrays and launches its kernels in order.
    pub fn run(&mut self, program: &Program) -> Result<LaunchStats, SimError> {
        let host = self.host_env(program);
        let lookup = |n: &VName| host.get(n).copied();
        for alloc in &program.allocs {
            let len = eval::eval_int(&alloc.len, &lookup)?;
            let len = usize::try_from(len).map_err(|_| SimError::OutOfBounds {
                array: alloc.name.clone(),
                index: len,
                len: 0,
            })?;
            trace!(array = %alloc.name, len, "allocating");
            self.global
                .insert(alloc.name.clone(), Buffer::zeroed(alloc.ty, len));
        }

        let mut stats = LaunchStats::default();
        for kernel in &program.kernels {
            let mut env = HashMap::new();
            for u in &kernel.uses {
                match u {
                    KernelUse::Scalar(name, ty) => match host.get(name) {
                        Some(v) if v.ty() == *ty => {
                            env.insert(name.clone(), *v);
                        }
                        Some(v) => {
                            return Err(SimError::TypeMismatch {
                                what: format!(
                                    "`{}` is {} but the kernel expects {}",
                                    name,
                                    v.ty(),
                                    ty
                                ),
                            })
                        }
                        None => return Err(SimError::UnboundUse(name.clone())),
                    },
                    KernelUse::Memory(name) => {
                        if !self.global.contains_key(name) {
                            return Err(SimError::UnboundUse(name.clone()));
                        }
                    }
                    KernelUse::Constant(name, v) => {
                        env.insert(name.clone(), *v);
                    }
                }
            }
            let num_groups = eval::eval_int(&kernel.num_groups, &lookup)?;
            let group_size = eval::eval_int(&kernel.group_size, &lookup)?;
            if num_groups < 0 || group_size <= 0 {
                return Err(SimError::InvalidLaunch {
                    kernel: kernel.name.clone(),
                    num_groups,
                    group_size,
                });
            }
            debug!(kernel = %kernel.name, num_groups, group_size, "launching");
            for gid in 0..num_groups {
                let mut run = GroupRun {
                    env: &env,
                    global: &mut self.global,
                    local: HashMap::new(),
                    threads: vec![],
                    gid,
                    group_size,
                    num_groups,
                    wave_size: self.wave_size.max(1),
                    schedule: self.schedule,
                    max_loop_iterations: self.max_loop_iterations,
                    races: self.race_check.then(RaceCheck::default),
                    stats: &mut stats,
                };
                run.run(&kernel.body)?;
            }
            stats.kernels += 1;
        }
        Ok(stats)
    }
}
