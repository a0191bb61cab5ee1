use core::num::NonZeroUsize;

/// Default number of task-window slots.
pub const DEFAULT_TASK_WINDOW: usize = 16_384;
/// Default number of dependency edges that may be live at once.
pub const DEFAULT_EDGE_POOL: usize = 65_536;
/// Default arena size in bytes.
pub const DEFAULT_ARENA_BYTES: u64 = 256 * 1024;
/// Default maximum nesting of scopes, the implicit outermost scope included.
pub const DEFAULT_MAX_SCOPE_DEPTH: usize = 32;
/// Default number of scheduler agents.
pub const DEFAULT_SCHEDULER_AGENTS: usize = 3;

/// Fixed capacities of a session. Nothing is resized after `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    /// Number of ring-buffer slots in the task window.
    pub task_window: NonZeroUsize,
    /// Number of dependency edges that may be outstanding at once.
    pub edge_pool: usize,
    /// Bytes available to the scoped arena.
    pub arena_bytes: u64,
    /// Maximum scope nesting depth.
    pub max_scope_depth: usize,
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            task_window: NonZeroUsize::new(DEFAULT_TASK_WINDOW).expect("Capacities::default: [1]"),
            edge_pool: DEFAULT_EDGE_POOL,
            arena_bytes: DEFAULT_ARENA_BYTES,
            max_scope_depth: DEFAULT_MAX_SCOPE_DEPTH,
        }
    }
}

impl Capacities {
    /// Override the task-window size.
    #[must_use]
    pub const fn with_task_window(mut self, slots: NonZeroUsize) -> Self {
        self.task_window = slots;
        self
    }

    /// Override the edge-pool size.
    #[must_use]
    pub const fn with_edge_pool(mut self, edges: usize) -> Self {
        self.edge_pool = edges;
        self
    }

    /// Override the arena size.
    #[must_use]
    pub const fn with_arena_bytes(mut self, bytes: u64) -> Self {
        self.arena_bytes = bytes;
        self
    }

    /// Override the maximum scope depth.
    #[must_use]
    pub const fn with_max_scope_depth(mut self, depth: usize) -> Self {
        self.max_scope_depth = depth;
        self
    }
}

/// Execution-side configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of scheduler agents, each running on its own thread.
    pub agents: NonZeroUsize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            agents: NonZeroUsize::new(DEFAULT_SCHEDULER_AGENTS)
                .expect("SchedulerConfig::default: [1]"),
        }
    }
}

impl SchedulerConfig {
    /// Override the number of scheduler agents.
    #[must_use]
    pub const fn with_agents(mut self, agents: NonZeroUsize) -> Self {
        self.agents = agents;
        self
    }
}
