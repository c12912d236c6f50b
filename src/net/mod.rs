// Kernel networking layer: the driver trait every host mutation flows
// through, plus the shell-based production implementation.

pub mod command;
pub mod driver;
pub mod shell;

pub use driver::{FilterRule, NetworkDriver, Protocol, Route, Verdict};
pub use shell::ShellDriver;
