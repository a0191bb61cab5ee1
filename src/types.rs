use derive_more::{Display, From};
use indexmap::IndexSet as _IndexSet;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Unique identifier of a submitted task.
///
/// Ids are assigned in submission order starting at zero, so an id comparison
/// is also a submission-order comparison. Every dependency edge points from a
/// smaller id to a larger one.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
#[display("t{_0}")]
pub struct TaskId(pub u64);

impl TaskId {
    /// Raw sequence number of the task.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identifier of a compiled kernel entry point in the external kernel registry.
pub type FunctionId = u32;

/// Address-equivalent token of a device buffer.
///
/// The runtime never dereferences addresses; it only compares and offsets them.
pub type Address = u64;

/// Worker capability class. Every class owns exactly one ready queue.
///
/// The set is closed on purpose: the per-class queue array is sized by
/// [`WorkerClass::COUNT`].
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerClass {
    /// Matrix-style compute unit (matmul, convolution).
    #[display("matrix")]
    MatrixUnit = 0,
    /// Vector-style compute unit (element-wise, activation).
    #[display("vector")]
    VectorUnit = 1,
}

impl WorkerClass {
    /// Number of worker classes.
    pub const COUNT: usize = 2;
    /// All worker classes in tag order.
    pub const ALL: [Self; Self::COUNT] = [Self::MatrixUnit, Self::VectorUnit];

    /// Position of the class's ready queue.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for WorkerClass {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::MatrixUnit),
            1 => Ok(Self::VectorUnit),
            other => Err(other),
        }
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexSet` type with fast hasher.
pub type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
