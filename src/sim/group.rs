use super::eval::{binop, eval, eval_bool, eval_int};
use super::{Buffer, LaunchStats, Schedule, SimError};
use crate::ir::{AtomicBinOp, AtomicOp, BinOp, Exp, KernelOp, MemRef, PrimValue, Space, Stmt, VName};
use std::collections::HashMap;

#[derive(Default)]
pub(super) struct ThreadState {
    scalars: HashMap<VName, PrimValue>,
    private: HashMap<VName, Buffer>,
}

/// One work-group executing a kernel body.
pub(super) struct GroupRun<'a> {
    pub env: &'a HashMap<VName, PrimValue>,
    pub global: &'a mut HashMap<VName, Buffer>,
    pub local: HashMap<VName, Buffer>,
    pub threads: Vec<ThreadState>,
    pub gid: i64,
    pub group_size: i64,
    pub num_groups: i64,
    pub wave_size: i64,
    pub schedule: Schedule,
    pub max_loop_iterations: u64,
    pub races: Option<RaceCheck>,
    pub stats: &'a mut LaunchStats,
}

type Mask = Vec<bool>;

#[derive(Default)]
struct Cell {
    /// Epoch and wave of the last plain write.
    write: Option<(u64, i64)>,
    read_epoch: u64,
    read_waves: Vec<i64>,
}

/// Plain memory accesses of one group, split into epochs by barriers. Atomics and private
/// memory never race.
#[derive(Default)]
pub(super) struct RaceCheck {
    epoch: u64,
    cells: HashMap<(Space, VName, i64), Cell>,
}

impl RaceCheck {
    fn race(mem: &MemRef, index: i64, first: i64, second: i64) -> SimError {
        SimError::DataRace {
            array: mem.name.clone(),
            index,
            first,
            second,
        }
    }

    fn read(&mut self, mem: &MemRef, index: i64, wave: i64) -> Result<(), SimError> {
        let epoch = self.epoch;
        let cell = self.cells.entry((mem.space, mem.name.clone(), index)).or_default();
        if let Some((e, w)) = cell.write {
            if e == epoch && w != wave {
                return Err(Self::race(mem, index, w, wave));
            }
        }
        if cell.read_epoch != epoch {
            cell.read_epoch = epoch;
            cell.read_waves.clear();
        }
        if !cell.read_waves.contains(&wave) {
            cell.read_waves.push(wave);
        }
        Ok(())
    }

    fn write(&mut self, mem: &MemRef, index: i64, wave: i64) -> Result<(), SimError> {
        let epoch = self.epoch;
        let cell = self.cells.entry((mem.space, mem.name.clone(), index)).or_default();
        if let Some((e, w)) = cell.write {
            if e == epoch && w != wave {
                return Err(Self::race(mem, index, w, wave));
            }
        }
        if cell.read_epoch == epoch {
            if let Some(r) = cell.read_waves.iter().find(|r| **r != wave) {
                return Err(Self::race(mem, index, *r, wave));
            }
        }
        cell.write = Some((epoch, wave));
        Ok(())
    }
}

fn mismatch(what: String) -> SimError {
    SimError::TypeMismatch { what }
}

impl GroupRun<'_> {
    pub fn run(&mut self, body: &Stmt) -> Result<(), SimError> {
        self.threads = (0..self.group_size).map(|_| ThreadState::default()).collect();
        let mask = vec![true; self.threads.len()];
        self.exec(body, &mask)
    }

    fn wave_of(&self, t: usize) -> i64 {
        t as i64 / self.wave_size
    }

    fn track(&mut self, t: usize, mem: &MemRef, index: i64, write: bool) -> Result<(), SimError> {
        let wave = self.wave_of(t);
        match &mut self.races {
            Some(races) if mem.space != Space::Private => {
                if write {
                    races.write(mem, index, wave)
                } else {
                    races.read(mem, index, wave)
                }
            }
            _ => Ok(()),
        }
    }

    /// The active threads, in the order they take their turn.
    fn order(&self, mask: &[bool]) -> Vec<usize> {
        let active = (0..mask.len()).filter(|t| mask[*t]);
        match self.schedule {
            Schedule::Forward => active.collect(),
            Schedule::Reverse => active.rev().collect(),
        }
    }

    fn eval_in(&self, t: usize, exp: &Exp) -> Result<PrimValue, SimError> {
        let scalars = &self.threads[t].scalars;
        let env = self.env;
        eval(exp, &|n: &VName| scalars.get(n).or_else(|| env.get(n)).copied())
    }

    fn int_in(&self, t: usize, exp: &Exp) -> Result<i64, SimError> {
        let scalars = &self.threads[t].scalars;
        let env = self.env;
        eval_int(exp, &|n: &VName| scalars.get(n).or_else(|| env.get(n)).copied())
    }

    fn bool_in(&self, t: usize, exp: &Exp) -> Result<bool, SimError> {
        let scalars = &self.threads[t].scalars;
        let env = self.env;
        eval_bool(exp, &|n: &VName| scalars.get(n).or_else(|| env.get(n)).copied())
    }

    fn assign(&mut self, t: usize, name: &VName, v: PrimValue) -> Result<(), SimError> {
        match self.threads[t].scalars.get_mut(name) {
            Some(slot) if slot.ty() == v.ty() => {
                *slot = v;
                Ok(())
            }
            Some(slot) => Err(mismatch(format!(
                "assigning {} to `{}` of type {}",
                v.ty(),
                name,
                slot.ty()
            ))),
            None => Err(SimError::UnknownVariable(name.clone())),
        }
    }

    fn set_builtin(&mut self, mask: &[bool], name: &VName, value: impl Fn(i64) -> i64) {
        for t in self.order(mask) {
            self.threads[t]
                .scalars
                .insert(name.clone(), PrimValue::I64(value(t as i64)));
        }
    }

    fn buffer(&self, t: usize, mem: &MemRef) -> Result<&Buffer, SimError> {
        match mem.space {
            Space::Global => self.global.get(&mem.name),
            Space::Local => self.local.get(&mem.name),
            Space::Private => self.threads[t].private.get(&mem.name),
        }
        .ok_or_else(|| SimError::UnknownArray(mem.name.clone()))
    }

    fn buffer_mut(&mut self, t: usize, mem: &MemRef) -> Result<&mut Buffer, SimError> {
        match mem.space {
            Space::Global => self.global.get_mut(&mem.name),
            Space::Local => self.local.get_mut(&mem.name),
            Space::Private => self.threads[t].private.get_mut(&mem.name),
        }
        .ok_or_else(|| SimError::UnknownArray(mem.name.clone()))
    }

    fn load(&self, t: usize, mem: &MemRef, index: i64) -> Result<PrimValue, SimError> {
        let buf = self.buffer(t, mem)?;
        let slot = slot(buf, mem, index)?;
        Ok(PrimValue::from_bits(mem.ty, buf.bits[slot]))
    }

    fn store(&mut self, t: usize, mem: &MemRef, index: i64, v: PrimValue) -> Result<(), SimError> {
        if v.ty() != mem.ty {
            return Err(mismatch(format!(
                "storing {} through a view of {} on `{}`",
                v.ty(),
                mem.ty,
                mem.name
            )));
        }
        let buf = self.buffer_mut(t, mem)?;
        let slot = slot(buf, mem, index)?;
        buf.bits[slot] = v.to_bits();
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, mask: &[bool]) -> Result<(), SimError> {
        if !mask.iter().any(|m| *m) {
            return Ok(());
        }
        match stmt {
            Stmt::Skip => {}
            Stmt::Seq(stmts) => {
                for s in stmts {
                    self.exec(s, mask)?;
                }
            }
            Stmt::Comment(_, body) => self.exec(body, mask)?,
            Stmt::DeclareScalar { name, ty, .. } => {
                for t in self.order(mask) {
                    self.threads[t]
                        .scalars
                        .insert(name.clone(), PrimValue::zero(*ty));
                }
            }
            Stmt::DeclareArray {
                name,
                ty,
                len,
                space,
            } => {
                for t in self.order(mask) {
                    let n = self.int_in(t, len)?;
                    let n = usize::try_from(n).map_err(|_| SimError::OutOfBounds {
                        array: name.clone(),
                        index: n,
                        len: 0,
                    })?;
                    match space {
                        Space::Local => {
                            self.local
                                .entry(name.clone())
                                .or_insert_with(|| Buffer::zeroed(*ty, n));
                        }
                        Space::Private => {
                            self.threads[t]
                                .private
                                .insert(name.clone(), Buffer::zeroed(*ty, n));
                        }
                        Space::Global => {
                            return Err(mismatch(format!(
                                "global array `{}` declared inside a kernel",
                                name
                            )))
                        }
                    }
                }
            }
            Stmt::SetScalar { name, exp } => {
                for t in self.order(mask) {
                    let v = self.eval_in(t, exp)?;
                    self.assign(t, name, v)?;
                }
            }
            Stmt::Read { dest, mem, index } => {
                for t in self.order(mask) {
                    let i = self.int_in(t, index)?;
                    let v = self.load(t, mem, i)?;
                    self.track(t, mem, i, false)?;
                    self.assign(t, dest, v)?;
                }
            }
            Stmt::Write { mem, index, value } => {
                for t in self.order(mask) {
                    let i = self.int_in(t, index)?;
                    let v = self.eval_in(t, value)?;
                    self.store(t, mem, i, v)?;
                    self.track(t, mem, i, true)?;
                }
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut then_mask: Mask = vec![false; mask.len()];
                let mut else_mask: Mask = vec![false; mask.len()];
                for t in self.order(mask) {
                    if self.bool_in(t, cond)? {
                        then_mask[t] = true;
                    } else {
                        else_mask[t] = true;
                    }
                }
                self.exec(then_branch, &then_mask)?;
                self.exec(else_branch, &else_mask)?;
            }
            Stmt::For { iter, bound, body } => {
                let mut bounds = vec![0i64; mask.len()];
                for t in self.order(mask) {
                    bounds[t] = self.int_in(t, bound)?;
                }
                let trips = bounds.iter().copied().max().unwrap_or(0).max(0);
                if trips as u64 > self.max_loop_iterations {
                    return Err(SimError::LoopLimit);
                }
                for k in 0..trips {
                    let inner: Mask = (0..mask.len()).map(|t| mask[t] && k < bounds[t]).collect();
                    for t in self.order(&inner) {
                        self.threads[t]
                            .scalars
                            .insert(iter.clone(), PrimValue::I64(k));
                    }
                    self.exec(body, &inner)?;
                }
            }
            Stmt::While { cond, body } => {
                let mut live: Mask = mask.to_vec();
                let mut iterations = 0u64;
                loop {
                    for t in self.order(&live) {
                        live[t] = self.bool_in(t, cond)?;
                    }
                    if !live.iter().any(|l| *l) {
                        break;
                    }
                    iterations += 1;
                    if iterations > self.max_loop_iterations {
                        return Err(SimError::LoopLimit);
                    }
                    self.exec(body, &live)?;
                }
            }
            Stmt::Op(op) => self.kernel_op(op, mask)?,
        }
        Ok(())
    }

    fn kernel_op(&mut self, op: &KernelOp, mask: &[bool]) -> Result<(), SimError> {
        let (gid, group_size) = (self.gid, self.group_size);
        let (num_groups, wave) = (self.num_groups, self.wave_size);
        match op {
            KernelOp::GetGlobalId(v) => self.set_builtin(mask, v, |t| gid * group_size + t),
            KernelOp::GetLocalId(v) => self.set_builtin(mask, v, |t| t),
            KernelOp::GetGroupId(v) => self.set_builtin(mask, v, |_| gid),
            KernelOp::GetLocalSize(v) => self.set_builtin(mask, v, |_| group_size),
            KernelOp::GetNumGroups(v) => self.set_builtin(mask, v, |_| num_groups),
            KernelOp::GetLockstepWidth(v) => self.set_builtin(mask, v, |_| wave),
            KernelOp::Barrier(_) => {
                self.stats.barriers += 1;
                if let Some(races) = &mut self.races {
                    races.epoch += 1;
                }
            }
            KernelOp::MemFence(_) => {}
            KernelOp::Atomic(atomic) => self.atomic(atomic, mask)?,
        }
        Ok(())
    }

    fn atomic(&mut self, op: &AtomicOp, mask: &[bool]) -> Result<(), SimError> {
        for t in self.order(mask) {
            match op {
                AtomicOp::Rmw {
                    op,
                    old,
                    mem,
                    index,
                    value,
                } => {
                    let i = self.int_in(t, index)?;
                    let v = self.eval_in(t, value)?;
                    let current = self.load(t, mem, i)?;
                    let new = rmw(*op, current, v)?;
                    self.store(t, mem, i, new)?;
                    self.assign(t, old, current)?;
                }
                AtomicOp::Cas {
                    old,
                    mem,
                    index,
                    expected,
                    desired,
                } => {
                    let i = self.int_in(t, index)?;
                    let expected = self.eval_in(t, expected)?;
                    let desired = self.eval_in(t, desired)?;
                    if expected.ty() != mem.ty {
                        return Err(mismatch(format!(
                            "compare-and-swap expecting {} on a view of {}",
                            expected.ty(),
                            mem.ty
                        )));
                    }
                    let current = self.load(t, mem, i)?;
                    if current == expected {
                        self.store(t, mem, i, desired)?;
                    }
                    self.assign(t, old, current)?;
                }
            }
            self.stats.atomics += 1;
        }
        Ok(())
    }
}

fn rmw(op: AtomicBinOp, current: PrimValue, v: PrimValue) -> Result<PrimValue, SimError> {
    let op = match op {
        AtomicBinOp::Xchg => return Ok(v),
        AtomicBinOp::Add => BinOp::Add,
        AtomicBinOp::Min => BinOp::Min,
        AtomicBinOp::Max => BinOp::Max,
        AtomicBinOp::And => BinOp::And,
        AtomicBinOp::Or => BinOp::Or,
        AtomicBinOp::Xor => BinOp::Xor,
    };
    binop(op, current, v)
}

/// Checks the view and the bounds of an access.
fn slot(buf: &Buffer, mem: &MemRef, index: i64) -> Result<usize, SimError> {
    if buf.ty != mem.ty && buf.ty.bit_width() != mem.ty.bit_width() {
        return Err(mismatch(format!(
            "`{}` holds {} but is accessed as {}",
            mem.name, buf.ty, mem.ty
        )));
    }
    usize::try_from(index)
        .ok()
        .filter(|i| *i < buf.bits.len())
        .ok_or_else(|| SimError::OutOfBounds {
            array: mem.name.clone(),
            index,
            len: buf.bits.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::super::Device;
    use super::*;
    use crate::ir::{Fence, Kernel, KernelUse, PrimType, Program};

    fn kernel(body: Stmt, uses: Vec<KernelUse>, num_groups: i64, group_size: i64) -> Program {
        Program {
            allocs: vec![],
            tuning_params: vec![],
            kernels: vec![Kernel {
                name: "test".to_string(),
                body,
                uses,
                num_groups: Exp::int(num_groups),
                group_size: Exp::int(group_size),
                failure_tolerant: true,
            }],
        }
    }

    #[test]
    fn statements_run_in_lockstep() {
        // Every thread reads its right neighbour before anyone writes.
        let ltid = VName::new("ltid");
        let x = VName::new("x");
        let out = MemRef::new(&VName::new("out"), PrimType::I64, Space::Global);
        let body = Stmt::seq(vec![
            Stmt::declare(&ltid, PrimType::I64),
            Stmt::Op(KernelOp::GetLocalId(ltid.clone())),
            Stmt::declare(&x, PrimType::I64),
            Stmt::when(
                Exp::var(&ltid).lt(Exp::int(3)),
                out.read(&x, Exp::var(&ltid) + Exp::int(1)),
            ),
            Stmt::when(
                Exp::var(&ltid).lt(Exp::int(3)),
                out.write(Exp::var(&ltid), Exp::var(&x)),
            ),
        ]);
        let mut dev = Device::new(32);
        dev.upload_i64("out", &[1, 2, 3, 4]);
        let program = kernel(body, vec![KernelUse::Memory(out.name.clone())], 1, 4);
        dev.run(&program).unwrap();
        assert_eq!(dev.download_i64("out").unwrap(), vec![2, 3, 4, 4]);
    }

    #[test]
    fn atomics_follow_the_schedule() {
        let ltid = VName::new("ltid");
        let old = VName::new("old");
        let cell = MemRef::new(&VName::new("cell"), PrimType::I64, Space::Global);
        let body = Stmt::seq(vec![
            Stmt::declare(&ltid, PrimType::I64),
            Stmt::Op(KernelOp::GetLocalId(ltid.clone())),
            Stmt::declare(&old, PrimType::I64),
            Stmt::atomic(AtomicOp::Rmw {
                op: AtomicBinOp::Xchg,
                old: old.clone(),
                mem: cell.clone(),
                index: Exp::int(0),
                value: Exp::var(&ltid),
            }),
            Stmt::barrier(Fence::Global),
        ]);
        let program = kernel(body, vec![KernelUse::Memory(cell.name.clone())], 1, 8);
        for (schedule, last) in [(Schedule::Forward, 7), (Schedule::Reverse, 0)] {
            let mut dev = Device::new(32).with_schedule(schedule);
            dev.upload_i64("cell", &[-1]);
            let stats = dev.run(&program).unwrap();
            assert_eq!(dev.download_i64("cell").unwrap(), vec![last], "{:?}", schedule);
            assert_eq!(stats.atomics, 8);
            assert_eq!(stats.barriers, 1);
        }
    }

    #[test]
    fn out_of_bounds_access_is_reported() {
        let out = MemRef::new(&VName::new("out"), PrimType::I32, Space::Global);
        let body = out.write(Exp::int(4), Exp::i32(1));
        let mut dev = Device::new(32);
        dev.upload_i32("out", &[0; 4]);
        let program = kernel(body, vec![KernelUse::Memory(out.name.clone())], 1, 1);
        assert!(matches!(
            dev.run(&program),
            Err(SimError::OutOfBounds { index: 4, len: 4, .. })
        ));
    }

    #[test]
    fn unbound_uses_are_rejected() {
        let n = VName::new("n");
        let program = kernel(Stmt::Skip, vec![KernelUse::Scalar(n.clone(), PrimType::I64)], 1, 1);
        let mut dev = Device::new(32);
        assert_eq!(dev.run(&program), Err(SimError::UnboundUse(n)));
        dev.bind_scalar("n", PrimValue::I64(3));
        assert!(dev.run(&program).is_ok());
    }

    #[test]
    fn runaway_loops_hit_the_limit() {
        let body = Stmt::while_loop(Exp::bool(true), Stmt::Skip);
        let mut dev = Device::new(32).with_max_loop_iterations(100);
        assert_eq!(dev.run(&kernel(body, vec![], 1, 1)), Err(SimError::LoopLimit));
    }

    /// Thread `reader` reads `cell[0]` while thread 0 overwrites it, optionally with a barrier
    /// in between.
    fn shared_slot(reader: i64, barrier: bool) -> Program {
        let ltid = VName::new("ltid");
        let x = VName::new("x");
        let cell = MemRef::new(&VName::new("cell"), PrimType::I64, Space::Local);
        let body = Stmt::seq(vec![
            Stmt::declare(&ltid, PrimType::I64),
            Stmt::Op(KernelOp::GetLocalId(ltid.clone())),
            Stmt::declare_array(&cell.name, PrimType::I64, Exp::int(1), Space::Local),
            Stmt::declare(&x, PrimType::I64),
            Stmt::when(Exp::var(&ltid).equals(Exp::int(reader)), cell.read(&x, Exp::int(0))),
            if barrier {
                Stmt::barrier(Fence::Local)
            } else {
                Stmt::Skip
            },
            Stmt::when(
                Exp::var(&ltid).equals(Exp::int(0)),
                cell.write(Exp::int(0), Exp::int(7)),
            ),
        ]);
        kernel(body, vec![], 1, 4)
    }

    #[test]
    fn unsynchronised_waves_are_reported() {
        let mut dev = Device::new(2).with_race_check();
        assert!(matches!(
            dev.run(&shared_slot(2, false)),
            Err(SimError::DataRace { index: 0, first: 1, second: 0, .. })
        ));
        assert!(dev.run(&shared_slot(2, true)).is_ok(), "a barrier orders the waves");
        assert!(dev.run(&shared_slot(1, false)).is_ok(), "one wave runs in lockstep");
        assert!(
            Device::new(2).run(&shared_slot(2, false)).is_ok(),
            "checking is opt-in"
        );
    }
}
