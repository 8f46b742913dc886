//! Sandboxed action runner for file-forensics challenges.
//!
//! A decision provider proposes one small action at a time against an
//! untrusted challenge directory; the runner validates it, executes it under a
//! fixed policy, scans the output for a flag and loops until something stops
//! it. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (action validation, policy gates,
//!   flag scanning, session state). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, confinement,
//!   the sandbox, config, artifacts). Isolated behind traits for tests.
//! - **[`agents`]**: Decision providers (built-in rules, external agent commands).
//!
//! Orchestration modules ([`session`], [`solve`]) coordinate core logic with
//! I/O to implement CLI commands.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
pub mod solve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
