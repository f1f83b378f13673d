//! Knobs of a lowering session.

use crate::ir::{AtomicBinOp, BinOp, PrimType};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_GROUP_SIZE: i64 = 256;

/// Upper bound on the number of locks a histogram lock array gets; bucket indices are hashed
/// into it.
pub const DEFAULT_MAX_LOCKS: i64 = 100151;

/// Which `(operator, type)` pairs a backend implements as native atomics.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AtomicsTable {
    Cuda,
    OpenCl,
}

impl AtomicsTable {
    pub fn native(&self, op: BinOp, ty: PrimType) -> Option<AtomicBinOp> {
        let int32 = matches!(ty, PrimType::I32 | PrimType::U32);
        match op {
            BinOp::Add if int32 => Some(AtomicBinOp::Add),
            BinOp::Add if ty == PrimType::F32 && *self == AtomicsTable::Cuda => {
                Some(AtomicBinOp::Add)
            }
            BinOp::Min if int32 => Some(AtomicBinOp::Min),
            BinOp::Max if int32 => Some(AtomicBinOp::Max),
            BinOp::And if int32 => Some(AtomicBinOp::And),
            BinOp::Or if int32 => Some(AtomicBinOp::Or),
            BinOp::Xor if int32 => Some(AtomicBinOp::Xor),
            _ => None,
        }
    }
}

impl std::str::FromStr for AtomicsTable {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cuda" => Ok(AtomicsTable::Cuda),
            "opencl" => Ok(AtomicsTable::OpenCl),
            _ => Err(ConfigError::Invalid {
                key: "atomics".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Default sizes for runtime-tunable parameters, keyed by a stable per-kernel name.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SizeClasses {
    pub default_group_size: i64,
    overrides: BTreeMap<String, i64>,
}

impl SizeClasses {
    pub fn new(default_group_size: i64) -> Self {
        SizeClasses {
            default_group_size,
            overrides: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, group_size: i64) {
        self.overrides.insert(key.to_string(), group_size);
    }

    pub fn group_size(&self, key: &str) -> i64 {
        self.overrides
            .get(key)
            .copied()
            .unwrap_or(self.default_group_size)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: String, value: String },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LowerConfig {
    pub atomics: AtomicsTable,
    pub size_classes: SizeClasses,
    pub max_locks: i64,
    /// Guard body array reads with bounds checks.
    pub idx_checks: bool,
}

impl Default for LowerConfig {
    fn default() -> Self {
        LowerConfig {
            atomics: AtomicsTable::Cuda,
            size_classes: SizeClasses::new(DEFAULT_GROUP_SIZE),
            max_locks: DEFAULT_MAX_LOCKS,
            idx_checks: false,
        }
    }
}

impl LowerConfig {
    /// The default configuration with `SEGLOWER_GROUP_SIZE`, `SEGLOWER_ATOMICS` and
    /// `SEGLOWER_MAX_LOCKS` applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LowerConfig::default();
        if let Some(v) = lookup("SEGLOWER_GROUP_SIZE") {
            config.size_classes.default_group_size = parse_positive("SEGLOWER_GROUP_SIZE", &v)?;
        }
        if let Some(v) = lookup("SEGLOWER_ATOMICS") {
            config.atomics = v.parse().map_err(|_| ConfigError::Invalid {
                key: "SEGLOWER_ATOMICS".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("SEGLOWER_MAX_LOCKS") {
            config.max_locks = parse_positive("SEGLOWER_MAX_LOCKS", &v)?;
        }
        Ok(config)
    }
}

pub(crate) fn parse_positive(key: &str, value: &str) -> Result<i64, ConfigError> {
    match value.trim().parse::<i64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_add_is_native_on_cuda_only() {
        assert_eq!(
            AtomicsTable::Cuda.native(BinOp::Add, PrimType::F32),
            Some(AtomicBinOp::Add)
        );
        assert_eq!(AtomicsTable::OpenCl.native(BinOp::Add, PrimType::F32), None);
        assert_eq!(
            AtomicsTable::OpenCl.native(BinOp::Add, PrimType::I32),
            Some(AtomicBinOp::Add)
        );
    }

    #[test]
    fn wide_and_unsupported_ops_have_no_native_atomic() {
        assert_eq!(AtomicsTable::Cuda.native(BinOp::Add, PrimType::I64), None);
        assert_eq!(AtomicsTable::Cuda.native(BinOp::Mul, PrimType::I32), None);
        assert_eq!(AtomicsTable::Cuda.native(BinOp::Min, PrimType::F32), None);
    }

    #[test]
    fn environment_overrides() {
        let config = LowerConfig::from_lookup(|key| match key {
            "SEGLOWER_GROUP_SIZE" => Some("128".to_string()),
            "SEGLOWER_ATOMICS" => Some("opencl".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.size_classes.default_group_size, 128);
        assert_eq!(config.atomics, AtomicsTable::OpenCl);
        assert_eq!(config.max_locks, DEFAULT_MAX_LOCKS);
    }

    #[test]
    fn rejects_bad_values() {
        let err = LowerConfig::from_lookup(|key| match key {
            "SEGLOWER_MAX_LOCKS" => Some("-3".to_string()),
            _ => None,
        });
        assert!(err.is_err(), "negative lock count accepted");
        let err = LowerConfig::from_lookup(|key| match key {
            "SEGLOWER_ATOMICS" => Some("metal".to_string()),
            _ => None,
        });
        assert!(err.is_err(), "unknown atomics table accepted");
    }

    #[test]
    fn size_class_overrides() {
        let mut classes = SizeClasses::new(256);
        classes.set("builtin#replicate.group_size", 64);
        assert_eq!(classes.group_size("builtin#replicate.group_size"), 64);
        assert_eq!(classes.group_size("builtin#iota.group_size"), 256);
    }
}
