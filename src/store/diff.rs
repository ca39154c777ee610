//! Line-based patch computation and replay.
//!
//! Patches are computed by trimming the common prefix and suffix of the
//! two snapshots and recording the middle as a delete + insert. Lines are
//! split inclusively of their newline, so replaying a patch reproduces
//! the target byte-for-byte, trailing newline included.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch runs past the end of its base ({cursor} + {wanted} of {len} lines)")]
    OutOfRange {
        cursor: usize,
        wanted: usize,
        len: usize,
    },

    #[error("Patch does not cover its base ({covered} of {len} lines)")]
    Uncovered { covered: usize, len: usize },
}

/// One patch instruction, applied against the base's line list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Copy the next `count` base lines
    Keep { count: usize },
    /// Skip the next `count` base lines
    Drop { count: usize },
    /// Emit these lines
    Insert { lines: Vec<String> },
}

fn split_lines(content: &str) -> Vec<&str> {
    content.split_inclusive('\n').collect()
}

/// Compute a patch transforming `old` into `new`.
pub fn compute_patch(old: &str, new: &str) -> Vec<PatchOp> {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut ops = Vec::new();
    if prefix > 0 {
        ops.push(PatchOp::Keep { count: prefix });
    }
    let dropped = old_lines.len() - prefix - suffix;
    if dropped > 0 {
        ops.push(PatchOp::Drop { count: dropped });
    }
    let inserted = &new_lines[prefix..new_lines.len() - suffix];
    if !inserted.is_empty() {
        ops.push(PatchOp::Insert {
            lines: inserted.iter().map(|l| l.to_string()).collect(),
        });
    }
    if suffix > 0 {
        ops.push(PatchOp::Keep { count: suffix });
    }
    ops
}

/// Replay a patch against its base.
pub fn apply_patch(base: &str, ops: &[PatchOp]) -> Result<String, PatchError> {
    let base_lines = split_lines(base);
    let mut out = String::with_capacity(base.len());
    let mut cursor = 0;

    for op in ops {
        match op {
            PatchOp::Keep { count } => {
                if cursor + count > base_lines.len() {
                    return Err(PatchError::OutOfRange {
                        cursor,
                        wanted: *count,
                        len: base_lines.len(),
                    });
                }
                for line in &base_lines[cursor..cursor + count] {
                    out.push_str(line);
                }
                cursor += count;
            }
            PatchOp::Drop { count } => {
                if cursor + count > base_lines.len() {
                    return Err(PatchError::OutOfRange {
                        cursor,
                        wanted: *count,
                        len: base_lines.len(),
                    });
                }
                cursor += count;
            }
            PatchOp::Insert { lines } => {
                for line in lines {
                    out.push_str(line);
                }
            }
        }
    }

    if cursor != base_lines.len() {
        return Err(PatchError::Uncovered {
            covered: cursor,
            len: base_lines.len(),
        });
    }
    Ok(out)
}
