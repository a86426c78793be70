//! Task and retry helpers shared by the engine.

mod err_spawn;
pub use err_spawn::*;

mod backoff;
pub use backoff::*;
