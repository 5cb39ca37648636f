//! The implementation of the `REJIT_LOG_IR` environment variable.
//!
//! `REJIT_LOG_IR` is a comma-separated subset of `pre-opt`, `post-opt` and `asm`;
//! matching phases are dumped to stderr as blocks compile. Unset means everything
//! here is a no-op.

use std::collections::HashSet;
use std::env;
use std::sync::LazyLock;

#[derive(Eq, Hash, PartialEq)]
pub enum Phase {
    PreOpt,
    PostOpt,
    Asm,
}

impl Phase {
    fn from_str(s: &str) -> Phase {
        match s {
            "pre-opt" => Phase::PreOpt,
            "post-opt" => Phase::PostOpt,
            "asm" => Phase::Asm,
            _ => panic!("invalid REJIT_LOG_IR phase: {s}"),
        }
    }
}

static LOG_PHASES: LazyLock<HashSet<Phase>> = LazyLock::new(|| {
    let mut phases = HashSet::new();
    if let Ok(x) = env::var("REJIT_LOG_IR") {
        for p in x.split(',').filter(|p| !p.is_empty()) {
            phases.insert(Phase::from_str(p.trim()));
        }
    }
    phases
});

pub fn should_log(phase: Phase) -> bool {
    LOG_PHASES.contains(&phase)
}

pub fn log_ir(s: &str) {
    eprintln!("{s}");
}
