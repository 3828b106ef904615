//! Redundancy code modes and the cluster's code-mode policy document

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ArgosyError;

/// A redundancy scheme supported by the cluster. The variant name matches
/// the `mode_name` string used in cluster manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeMode {
    EC15P12,
    EC6P6,
    EC16P20L2,
    EC6P10L2,
    EC12P4,
    EC3P3,
}

/// Shard layout of a code mode: `n` data shards, `m` parity shards and
/// `l` local (intra-AZ repair) shards. `n` is the effective write fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tactic {
    pub n: usize,
    pub m: usize,
    pub l: usize,
}

impl CodeMode {
    pub fn tactic(&self) -> Tactic {
        match self {
            CodeMode::EC15P12 => Tactic { n: 15, m: 12, l: 0 },
            CodeMode::EC6P6 => Tactic { n: 6, m: 6, l: 0 },
            CodeMode::EC16P20L2 => Tactic { n: 16, m: 20, l: 2 },
            CodeMode::EC6P10L2 => Tactic { n: 6, m: 10, l: 2 },
            CodeMode::EC12P4 => Tactic { n: 12, m: 4, l: 0 },
            CodeMode::EC3P3 => Tactic { n: 3, m: 3, l: 0 },
        }
    }
}

impl fmt::Display for CodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodeMode::EC15P12 => "EC15P12",
            CodeMode::EC6P6 => "EC6P6",
            CodeMode::EC16P20L2 => "EC16P20L2",
            CodeMode::EC6P10L2 => "EC6P10L2",
            CodeMode::EC12P4 => "EC12P4",
            CodeMode::EC3P3 => "EC3P3",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CodeMode {
    type Err = ArgosyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EC15P12" => Ok(CodeMode::EC15P12),
            "EC6P6" => Ok(CodeMode::EC6P6),
            "EC16P20L2" => Ok(CodeMode::EC16P20L2),
            "EC6P10L2" => Ok(CodeMode::EC6P10L2),
            "EC12P4" => Ok(CodeMode::EC12P4),
            "EC3P3" => Ok(CodeMode::EC3P3),
            other => Err(ArgosyError::InvalidParam(format!(
                "unknown code mode: {}",
                other
            ))),
        }
    }
}

/// One record of the `code_mode` policy document served by the cluster
/// manager. Disabled records produce no allocator state. The size fields
/// steer upload routing in the access layer and are carried through
/// unchanged here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeModePolicy {
    pub mode_name: CodeMode,
    #[serde(default)]
    pub min_size: u64,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub size_ratio: f64,
    #[serde(default)]
    pub enable: bool,
}
