#![cfg(test)]

use proptest::prelude::*;
use seglower::dsl::{binop_lambda, lambda, var};
use seglower::ir::{
    BinOp, Exp, Fence, Kernel, KernelUse, MemRef, NameSource, PrimType, Program, Space, Stmt,
    VName,
};
use seglower::lower::constants::{kernel_init, KernelConstants};
use seglower::lower::reduce::{group_reduce, virtualised_group_reduce, Layout};
use seglower::lower::scan::{crosses_segment, group_scan, virtualised_group_scan, SegFlag};
use seglower::lower::virtualize::{group_loop, virtualise_groups};
use seglower::segop::{Lambda, SegVirt};
use seglower::sim::{Device, Schedule};

const I64: PrimType = PrimType::I64;

fn launch(body: Stmt, arrays: &[&str], num_groups: i64, group_size: i64) -> Program {
    Program {
        allocs: vec![],
        tuning_params: vec![],
        kernels: vec![Kernel {
            name: "collective".to_string(),
            body,
            uses: arrays
                .iter()
                .map(|a| KernelUse::Memory(VName::new(a)))
                .collect(),
            num_groups: Exp::int(num_groups),
            group_size: Exp::int(group_size),
            failure_tolerant: true,
        }],
    }
}

fn global(name: &str) -> MemRef {
    MemRef::new(&VName::new(name), I64, Space::Global)
}

/// `(a, b)` stands for `v -> a * v + b`; combining applies the left function first.
fn affine() -> Lambda {
    lambda(
        vec![("a1", I64), ("b1", I64), ("a2", I64), ("b2", I64)],
        vec![
            var("a1") * var("a2"),
            var("a2") * var("b1") + var("b2"),
        ],
    )
}

fn affine_compose((a1, b1): (i64, i64), (a2, b2): (i64, i64)) -> (i64, i64) {
    (a1.wrapping_mul(a2), a2.wrapping_mul(b1).wrapping_add(b2))
}

/// Copies `global[i]` into `local[i]` for every `i` in `0..n`, striding over the group.
fn load(
    names: &mut NameSource,
    consts: &KernelConstants,
    pairs: &[(MemRef, MemRef)],
    n: i64,
) -> Stmt {
    let (i, nest) = group_loop(names, consts, Exp::int(n));
    let mut code = vec![];
    for (from, to) in pairs {
        let v = names.fresh("v");
        code.push(Stmt::declare(&v, from.ty));
        code.push(from.read(&v, i.clone()));
        code.push(to.write(i.clone(), Exp::var(&v)));
    }
    Stmt::seq(vec![nest.wrap(Stmt::seq(code)), Stmt::barrier(Fence::Local)])
}

fn store(
    names: &mut NameSource,
    consts: &KernelConstants,
    pairs: &[(MemRef, MemRef)],
    n: i64,
) -> Stmt {
    let flipped: Vec<(MemRef, MemRef)> =
        pairs.iter().map(|(g, l)| (l.clone(), g.clone())).collect();
    load(names, consts, &flipped, n)
}

fn locals(names: &mut NameSource, count: usize, len: i64) -> (Vec<MemRef>, Stmt) {
    let mems: Vec<MemRef> = (0..count)
        .map(|_| MemRef::new(&names.fresh("scratch"), I64, Space::Local))
        .collect();
    let decls = mems
        .iter()
        .map(|m| Stmt::declare_array(&m.name, I64, Exp::int(len), Space::Local))
        .collect();
    (mems, Stmt::seq(decls))
}

/// Reduces the first `w` elements of `input` with one group; thread 0 writes the total to
/// `out[0]`.
fn reduction_program(
    lam: &Lambda,
    arrays: &[(&str, &str)],
    w: i64,
    group_size: i64,
    virtualised: bool,
) -> Program {
    let mut names = NameSource::new();
    let (consts, init) = kernel_init(&mut names, Exp::int(1), Exp::int(group_size));
    let len = w.max(1);
    let (mems, decls) = locals(&mut names, arrays.len(), len);
    let inputs: Vec<(MemRef, MemRef)> = arrays
        .iter()
        .zip(&mems)
        .map(|((input, _), m)| (global(input), m.clone()))
        .collect();
    let reduce = if virtualised {
        virtualised_group_reduce(&mut names, &consts, Exp::int(w), lam, &mems)
    } else {
        group_reduce(&mut names, &consts, Exp::int(w), lam, &mems, &Layout::local())
    };
    let mut write_back = vec![];
    for ((_, out), m) in arrays.iter().zip(&mems) {
        let v = names.fresh("total");
        write_back.push(Stmt::declare(&v, I64));
        write_back.push(m.read(&v, Exp::int(0)));
        write_back.push(global(out).write(Exp::int(0), Exp::var(&v)));
    }
    let body = Stmt::seq(vec![
        init,
        decls,
        load(&mut names, &consts, &inputs, w),
        reduce,
        Stmt::barrier(Fence::Local),
        Stmt::when(consts.ltid().equals(Exp::int(0)), Stmt::seq(write_back)),
    ]);
    let used: Vec<&str> = arrays.iter().flat_map(|(i, o)| [*i, *o]).collect();
    launch(body, &used, 1, group_size)
}

/// Scans `input` in place with one group and writes the result to `out`.
fn scan_program(
    lam: &Lambda,
    arrays: &[(&str, &str)],
    w: i64,
    group_size: i64,
    segment: Option<i64>,
    virtualised: bool,
) -> Program {
    let mut names = NameSource::new();
    let (consts, init) = kernel_init(&mut names, Exp::int(1), Exp::int(group_size));
    let (mems, decls) = locals(&mut names, arrays.len(), w.max(1));
    let inputs: Vec<(MemRef, MemRef)> = arrays
        .iter()
        .zip(&mems)
        .map(|((input, _), m)| (global(input), m.clone()))
        .collect();
    let outputs: Vec<(MemRef, MemRef)> = arrays
        .iter()
        .zip(&mems)
        .map(|((_, out), m)| (global(out), m.clone()))
        .collect();
    let flag = segment.map(|m| crosses_segment(Exp::int(m)));
    let seg_flag: Option<SegFlag<'_>> = flag.as_ref().map(|f| f as SegFlag<'_>);
    let scan = if virtualised {
        virtualised_group_scan(&mut names, &consts, seg_flag, Exp::int(w), lam, &mems)
    } else {
        group_scan(&mut names, &consts, seg_flag, Exp::int(w), lam, &mems, &Layout::local())
    };
    let body = Stmt::seq(vec![
        init,
        decls,
        load(&mut names, &consts, &inputs, w),
        scan,
        Stmt::barrier(Fence::Local),
        store(&mut names, &consts, &outputs, w),
    ]);
    let used: Vec<&str> = arrays.iter().flat_map(|(i, o)| [*i, *o]).collect();
    launch(body, &used, 1, group_size)
}

#[test]
fn sum_of_seven_in_a_group_of_eight() {
    let lam = binop_lambda(BinOp::Add, I64);
    let program = reduction_program(&lam, &[("input", "out")], 7, 8, false);
    let mut dev = Device::new(4);
    dev.upload_i64("input", &[1, 2, 3, 4, 5, 6, 7]);
    dev.upload_i64("out", &[0]);
    dev.run(&program).unwrap();
    assert_eq!(dev.download_i64("out").unwrap(), vec![28], "group sum of 1..=7");
}

#[test]
fn reduction_without_lockstep_guarantee() {
    // A lockstep width of zero degrades to barriers between all steps.
    let lam = binop_lambda(BinOp::Max, I64);
    let program = reduction_program(&lam, &[("input", "out")], 5, 8, false);
    let mut dev = Device::new(0);
    dev.upload_i64("input", &[3, 9, -2, 4, 1]);
    dev.upload_i64("out", &[0]);
    let stats = dev.run(&program).unwrap();
    assert_eq!(dev.download_i64("out").unwrap(), vec![9]);
    assert!(stats.barriers >= 3, "cross-wave steps need barriers");
}

#[test]
fn virtualised_reduction_of_more_elements_than_threads() {
    let lam = binop_lambda(BinOp::Add, I64);
    let input: Vec<i64> = (1..=100).collect();
    let program = reduction_program(&lam, &[("input", "out")], 100, 16, true);
    let mut dev = Device::new(4);
    dev.upload_i64("input", &input);
    dev.upload_i64("out", &[0]);
    dev.run(&program).unwrap();
    assert_eq!(dev.download_i64("out").unwrap(), vec![5050]);
}

#[test]
fn segmented_scan_restarts_every_segment() {
    let lam = binop_lambda(BinOp::Add, I64);
    let program = scan_program(&lam, &[("input", "out")], 6, 8, Some(3), false);
    let mut dev = Device::new(32);
    dev.upload_i64("input", &[1; 6]);
    dev.upload_i64("out", &[0; 6]);
    dev.run(&program).unwrap();
    assert_eq!(dev.download_i64("out").unwrap(), vec![1, 2, 3, 1, 2, 3]);
}

#[test]
fn scan_spanning_several_blocks() {
    let lam = binop_lambda(BinOp::Add, I64);
    let program = scan_program(&lam, &[("input", "out")], 100, 128, None, false);
    let mut dev = Device::new(32);
    dev.upload_i64("input", &[1; 100]);
    dev.upload_i64("out", &[0; 100]);
    dev.run(&program).unwrap();
    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(dev.download_i64("out").unwrap(), expected);
}

#[test]
fn virtualised_segmented_scan_carries_only_within_segments() {
    let lam = binop_lambda(BinOp::Add, I64);
    let program = scan_program(&lam, &[("input", "out")], 20, 8, Some(5), true);
    let mut dev = Device::new(4);
    dev.upload_i64("input", &[1; 20]);
    dev.upload_i64("out", &[0; 20]);
    dev.run(&program).unwrap();
    let expected: Vec<i64> = (0..20).map(|i| i % 5 + 1).collect();
    assert_eq!(dev.download_i64("out").unwrap(), expected);
}

/// Inclusive prefix sums of `xs`, restarting every `segment` elements.
fn segmented_prefix_sums(xs: &[i64], segment: Option<i64>) -> Vec<i64> {
    let mut acc = 0;
    xs.iter()
        .enumerate()
        .map(|(i, x)| {
            if segment.map_or(false, |m| i as i64 % m == 0) {
                acc = 0;
            }
            acc += x;
            acc
        })
        .collect()
}

#[test]
fn block_scan_orders_carry_reads_before_first_block_restore() {
    // With waves of one block each, the carry-in reads of later blocks and the restore of the
    // first block come from different waves.
    let lam = binop_lambda(BinOp::Add, I64);
    for (w, group_size) in [(64, 64), (100, 128), (1024, 1024)] {
        for segment in [None, Some(5), Some(40)] {
            let program = scan_program(&lam, &[("input", "out")], w, group_size, segment, false);
            let input: Vec<i64> = (1..=w).collect();
            let mut dev = Device::new(32).with_race_check();
            dev.upload_i64("input", &input);
            dev.upload_i64("out", &vec![0; w as usize]);
            dev.run(&program)
                .unwrap_or_else(|err| panic!("w = {}, segment {:?}: {}", w, segment, err));
            assert_eq!(
                dev.download_i64("out").unwrap(),
                segmented_prefix_sums(&input, segment),
                "w = {}, segment {:?}",
                w,
                segment
            );
        }
    }
}

#[test]
fn collectives_are_race_free_with_narrow_waves() {
    let lam = binop_lambda(BinOp::Add, I64);
    let input: Vec<i64> = (1..=70).collect();
    for wave in [1, 4, 32, 64] {
        for virtualised in [false, true] {
            let group_size = if virtualised { 32 } else { 128 };
            let scan =
                scan_program(&lam, &[("input", "out")], 70, group_size, Some(9), virtualised);
            let mut dev = Device::new(wave).with_race_check();
            dev.upload_i64("input", &input);
            dev.upload_i64("out", &[0; 70]);
            dev.run(&scan)
                .unwrap_or_else(|err| panic!("scan, wave {}: {}", wave, err));
            assert_eq!(
                dev.download_i64("out").unwrap(),
                segmented_prefix_sums(&input, Some(9))
            );

            let red = reduction_program(&lam, &[("input", "total")], 70, group_size, virtualised);
            let mut dev = Device::new(wave).with_race_check();
            dev.upload_i64("input", &input);
            dev.upload_i64("total", &[0]);
            dev.run(&red)
                .unwrap_or_else(|err| panic!("reduction, wave {}: {}", wave, err));
            assert_eq!(dev.download_i64("total").unwrap(), vec![2485]);
        }
    }
}

fn visits_program(required: i64, num_groups: i64, group_size: i64) -> Program {
    let mut names = NameSource::new();
    let (consts, init) = kernel_init(&mut names, Exp::int(num_groups), Exp::int(group_size));
    let (vgid, nest) =
        virtualise_groups(&mut names, &consts, SegVirt::Virtualize, Exp::int(required));
    let (hits, owner) = (global("hits"), global("owner"));
    let seen = names.fresh("seen");
    let visit = Stmt::when(
        consts.ltid().equals(Exp::int(0)),
        Stmt::seq(vec![
            Stmt::declare(&seen, I64),
            hits.read(&seen, vgid.clone()),
            hits.write(vgid.clone(), Exp::var(&seen) + Exp::int(1)),
            owner.write(vgid, consts.gid()),
        ]),
    );
    let body = Stmt::seq(vec![init, nest.wrap(visit)]);
    launch(body, &["hits", "owner"], num_groups, group_size)
}

#[test]
fn three_groups_cover_ten_virtual_groups() {
    let program = visits_program(10, 3, 2);
    let mut dev = Device::new(32);
    dev.upload_i64("hits", &[0; 10]);
    dev.upload_i64("owner", &[-1; 10]);
    let stats = dev.run(&program).unwrap();
    assert_eq!(dev.download_i64("hits").unwrap(), vec![1; 10]);
    assert_eq!(
        dev.download_i64("owner").unwrap(),
        vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0],
        "physical group p visits p, p + 3, ..."
    );
    assert_eq!(stats.barriers, 10, "one barrier after every visit");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_virtual_group_is_visited_once(required in 0i64..40, num_groups in 1i64..8) {
        let program = visits_program(required, num_groups, 1);
        let mut dev = Device::new(32);
        let len = required.max(1) as usize;
        dev.upload_i64("hits", &vec![0; len]);
        dev.upload_i64("owner", &vec![-1; len]);
        dev.run(&program).unwrap();
        let hits = dev.download_i64("hits").unwrap();
        prop_assert!(hits[..required as usize].iter().all(|h| *h == 1));
        let owner = dev.download_i64("owner").unwrap();
        for (v, p) in owner[..required as usize].iter().enumerate() {
            prop_assert_eq!(*p, v as i64 % num_groups);
        }
    }

    #[test]
    fn reduction_matches_a_left_fold(
        elems in prop::collection::vec((-3i64..4, -50i64..50), 1..48),
        extra_threads in 0i64..20,
        wave in prop::sample::select(vec![0i64, 1, 2, 4, 8, 32]),
    ) {
        let w = elems.len() as i64;
        let arrays = [("as", "a"), ("bs", "b")];
        let program = reduction_program(&affine(), &arrays, w, w + extra_threads, false);
        let mut dev = Device::new(wave);
        dev.upload_i64("as", &elems.iter().map(|e| e.0).collect::<Vec<_>>());
        dev.upload_i64("bs", &elems.iter().map(|e| e.1).collect::<Vec<_>>());
        dev.upload_i64("a", &[0]);
        dev.upload_i64("b", &[0]);
        dev.run(&program).unwrap();
        let expected = elems.iter().copied().reduce(affine_compose).unwrap();
        prop_assert_eq!(dev.download_i64("a").unwrap()[0], expected.0);
        prop_assert_eq!(dev.download_i64("b").unwrap()[0], expected.1);
    }

    #[test]
    fn virtualised_reduction_matches_a_left_fold(
        elems in prop::collection::vec((-3i64..4, -50i64..50), 1..80),
        group_size in 1i64..24,
    ) {
        let w = elems.len() as i64;
        let arrays = [("as", "a"), ("bs", "b")];
        let program = reduction_program(&affine(), &arrays, w, group_size, true);
        let mut dev = Device::new(4);
        dev.upload_i64("as", &elems.iter().map(|e| e.0).collect::<Vec<_>>());
        dev.upload_i64("bs", &elems.iter().map(|e| e.1).collect::<Vec<_>>());
        dev.upload_i64("a", &[0]);
        dev.upload_i64("b", &[0]);
        dev.run(&program).unwrap();
        let expected = elems.iter().copied().reduce(affine_compose).unwrap();
        prop_assert_eq!(dev.download_i64("a").unwrap()[0], expected.0);
        prop_assert_eq!(dev.download_i64("b").unwrap()[0], expected.1);
    }

    #[test]
    fn scan_element_is_fold_of_its_segment_prefix(
        elems in prop::collection::vec((-3i64..4, -50i64..50), 1..70),
        segment in prop::option::of(1i64..9),
        virtualised in any::<bool>(),
        schedule in prop::sample::select(vec![Schedule::Forward, Schedule::Reverse]),
    ) {
        let w = elems.len() as i64;
        let group_size = if virtualised { 16 } else { w };
        let arrays = [("as", "a"), ("bs", "b")];
        let program =
            scan_program(&affine(), &arrays, w, group_size, segment, virtualised);
        let mut dev = Device::new(4).with_schedule(schedule);
        dev.upload_i64("as", &elems.iter().map(|e| e.0).collect::<Vec<_>>());
        dev.upload_i64("bs", &elems.iter().map(|e| e.1).collect::<Vec<_>>());
        dev.upload_i64("a", &vec![0; elems.len()]);
        dev.upload_i64("b", &vec![0; elems.len()]);
        dev.run(&program).unwrap();
        let (a, b) = (dev.download_i64("a").unwrap(), dev.download_i64("b").unwrap());
        let mut acc = None;
        for (i, e) in elems.iter().enumerate() {
            let starts_segment = segment.map_or(false, |m| i as i64 % m == 0);
            acc = match acc {
                Some(prev) if !starts_segment => Some(affine_compose(prev, *e)),
                _ => Some(*e),
            };
            prop_assert_eq!((a[i], b[i]), acc.unwrap(), "element {}", i);
        }
    }
}
