//! Task-graph orchestration runtime for heterogeneous accelerators.
//!
//! An orchestration function running on the host builds a dataflow graph of
//! kernel invocations through a [`Context`]. Dependencies are never declared;
//! they are inferred from the memory regions each task reads and writes.
//! Meanwhile, scheduler agents pop ready tasks from one queue per worker class
//! and hand them to an execution [`Backend`](task::Backend).
//!
//! Key modules:
//! - `region` and `region_map`: buffer identities, byte regions, hazard
//!   classification and the index of last writers and readers.
//! - `arena`: the scoped bump allocator that backs runtime-allocated outputs.
//! - `executor`: the task window with its dependency countdowns, the ready
//!   queues and the agent threads.
//! - `context`: the builder-facing session tying everything together.
//!
//! Quick start:
//! 1. Register kernels in a [`KernelRegistry`](registry::KernelRegistry), or
//!    implement [`Backend`](task::Backend).
//! 2. [`Context::begin`] with the orchestration arguments and a heap.
//! 3. Submit tasks with [`Context::submit_task`], nesting [`Context::scope`]s
//!    for short-lived intermediates.
//! 4. [`Context::end`] waits for the graph to drain and reports.
//!
//! When a task runs, every task that wrote a region it reads, and every task
//! that read a region it writes, has completed and published its effects.

/// Scoped bump allocator for runtime-allocated buffers.
pub mod arena;
/// Fixed capacities and scheduler settings of a session.
pub mod config;
/// The orchestration session exposed to graph builders.
///
/// Owns the dependency index and the arena, assigns task ids and feeds the
/// executor.
pub mod context;
/// Error types.
pub mod error;
/// Task window, ready queues and scheduler agents.
pub mod executor;
/// Buffer handles, strided views, regions and hazards.
pub mod region;
/// Dependency index of last writers and readers by byte range.
pub mod region_map;
/// Function-id to kernel lookup.
pub mod registry;
mod sync;
/// Task descriptors, parameters and the execution backend interface.
pub mod task;
/// Identifiers, worker classes and map aliases.
pub mod types;
mod utils;

pub use crate::{
    context::{BeginInfo, Context, ScopeGuard, SessionReport, TaskHandle},
    error::{OrchestrationError, Result},
};
