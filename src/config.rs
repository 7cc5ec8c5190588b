//! Tunable VM constants (SPEC_FULL §10 "Configuration"): everything the
//! book hard-codes as C preprocessor constants lives here instead, as
//! one small `Config` struct the CLI/REPL driver constructs and tests
//! can override (e.g. to force GC at a tiny heap).

/// Defaults match §5's numbers: a 64-frame call stack of 256-slot
/// frames (16384 operand slots total), and a GC that doubles its
/// threshold on every collection.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub stack_max: usize,
    pub frames_max: usize,
    pub initial_gc_threshold: usize,
    pub gc_growth_factor: usize,
    /// When set, every allocation triggers a collection regardless of
    /// the threshold. Used by GC tests to exercise mark/sweep without
    /// needing to allocate megabytes of garbage first.
    pub gc_stress: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            stack_max: 64 * 256,
            frames_max: 64,
            initial_gc_threshold: 1024 * 1024,
            gc_growth_factor: 2,
            gc_stress: false,
        }
    }
}

impl Config {
    pub fn with_gc_stress() -> Config {
        Config {
            gc_stress: true,
            initial_gc_threshold: 0,
            ..Config::default()
        }
    }
}
