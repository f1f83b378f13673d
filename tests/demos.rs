#![cfg(test)]

use seglower::config::LowerConfig;
use seglower::ir::{PrimValue, Program};
use seglower::lower::lower_module;
use seglower::parser::parse_str;
use seglower::segop::{Module, SubExp};
use seglower::sim::Device;
use std::path::PathBuf;

fn demo_path(name: &str) -> PathBuf {
    [env!("CARGO_MANIFEST_DIR"), "demos", name].iter().collect()
}

fn load(name: &str) -> (Module, Program) {
    let src = std::fs::read_to_string(demo_path(name)).unwrap();
    let module = parse_str(&src).unwrap_or_else(|err| panic!("{}: {}", name, err));
    let program = lower_module(&LowerConfig::default(), &module)
        .unwrap_or_else(|err| panic!("{}: {}", name, err));
    (module, program)
}

/// A device holding a zeroed buffer for every array of statically known size.
fn device_for(module: &Module) -> Device {
    let mut dev = Device::new(32);
    for (name, (ty, shape)) in &module.env.arrays {
        let len: Option<i64> = shape
            .iter()
            .map(|d| match d {
                SubExp::Const(v) => v.as_i64(),
                SubExp::Var(n) => module.env.constants.get(n).and_then(PrimValue::as_i64),
            })
            .product();
        if let Some(len) = len {
            dev.upload(name.as_str(), *ty, &vec![PrimValue::zero(*ty); len as usize])
                .unwrap();
        }
    }
    dev
}

#[test]
fn every_demo_lowers() {
    let dir = [env!("CARGO_MANIFEST_DIR"), "demos"].iter().collect::<PathBuf>();
    let mut seen = 0;
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().map_or(false, |e| e == "segop") {
            let text = seglower::compile_with(path.to_str().unwrap(), &LowerConfig::default())
                .unwrap_or_else(|_| panic!("{} failed to compile", path.display()));
            assert!(!text.is_empty());
            seen += 1;
        }
    }
    assert!(seen >= 5, "only {} demos found", seen);
}

#[test]
fn sum() {
    let (module, program) = load("sum.segop");
    let mut dev = device_for(&module);
    dev.run(&program).unwrap();
    assert_eq!(dev.download_i64("total").unwrap(), vec![500500]);
}

#[test]
fn histogram() {
    let (module, program) = load("histogram.segop");
    let mut dev = device_for(&module);
    dev.run(&program).unwrap();
    assert_eq!(dev.download_i32("counts").unwrap(), vec![250; 4]);
}

#[test]
fn rows() {
    let (module, program) = load("rows.segop");
    let mut dev = device_for(&module);
    let m: Vec<f32> = (0..6 * 32).map(|x| (x % 5) as f32).collect();
    dev.upload_f32("m", &m);
    dev.run(&program).unwrap();

    let sums = dev.download_f32("sums").unwrap();
    let prefix = dev.download_f32("prefix").unwrap();
    for (r, row) in m.chunks(32).enumerate() {
        assert_eq!(sums[r], row.iter().sum::<f32>(), "sum of row {}", r);
        let mut acc = 0.0;
        for (c, x) in row.iter().enumerate() {
            acc += x;
            assert_eq!(prefix[r * 32 + c], acc, "prefix {} of row {}", c, r);
        }
    }
}

#[test]
fn reverse() {
    let (module, program) = load("reverse.segop");
    assert!(
        program.kernels.iter().any(|k| !k.failure_tolerant),
        "scattered writes make the map unsafe to retry"
    );
    let mut dev = device_for(&module);
    dev.run(&program).unwrap();
    let expected: Vec<i32> = (0..16).rev().collect();
    assert_eq!(dev.download_i32("dst").unwrap(), expected);
}

#[test]
fn tiles() {
    let (module, program) = load("tiles.segop");
    let mut dev = device_for(&module);
    dev.run(&program).unwrap();
    let expected: Vec<i64> = (0..64).map(|x| x * 3).collect();
    assert_eq!(dev.download_i64("scaled").unwrap(), expected);
}

#[test]
fn pairs() {
    let (module, program) = load("pairs.segop");
    let vals = [7, 3, 9, -4, 12, -4, 0, 5, 8, -1];
    let mut dev = device_for(&module);
    dev.bind_scalar("n", PrimValue::I64(vals.len() as i64));
    dev.upload_i32("vals", &vals);
    dev.run(&program).unwrap();
    assert_eq!(dev.download_i32("best").unwrap(), vec![-4]);
    assert_eq!(dev.download_i64("at").unwrap(), vec![3], "first minimum wins");
}

#[test]
fn lanes() {
    let (module, program) = load("lanes.segop");
    let m: Vec<i64> = (0..4 * 40).map(|x| x % 9 - 4).collect();
    let mut dev = device_for(&module).with_race_check();
    dev.upload_i64("m", &m);
    dev.run(&program).unwrap();

    let moments = dev.download_i64("moments").unwrap();
    let running = dev.download_i64("running").unwrap();
    for (r, row) in m.chunks(40).enumerate() {
        let sum: i64 = row.iter().sum();
        let squares: i64 = row.iter().map(|v| v * v).sum();
        assert_eq!(&moments[r * 2..r * 2 + 2], &[sum, squares], "row {}", r);
        for c in 0..40 {
            let at = (r * 40 + c) * 2;
            let c = c as i64;
            assert_eq!(&running[at..at + 2], &[c * (c + 1) / 2, c + 1], "row {}", r);
        }
    }
}

#[test]
fn operator_results_must_cover_its_components() {
    let src = r"
const n: i64 = 2;

let s: [n]i64, t: [n]i64 = segmap@group(1, 4) g(r < n) {
  let a: i64, b: i64 = segred@thread l(c < 4)
      [op(\a1: i64, b1: i64, a2: i64, b2: i64 -> (a1 * a2, a2 * b1 + b2); (1, 0))] {
    return c
  };
  return a, b
};
";
    let module = parse_str(src).unwrap();
    let err = lower_module(&LowerConfig::default(), &module).unwrap_err();
    assert!(!err.is_limitation(), "{}", err);
    assert!(err.to_string().contains("1 results and 2 destinations"), "{}", err);
}
