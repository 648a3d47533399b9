//! Child process supervision and executable discovery.

pub mod locate;
pub mod supervisor;

pub use locate::ExecutableLocator;
pub use supervisor::{
    CommandOutput, OutputLine, OutputStream, SPAWN_FAILED_EXIT_CODE, SpawnRequest,
    SubprocessError, SupervisedProcess,
};
