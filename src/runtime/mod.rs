pub mod context;
pub mod runtime_error;
pub mod vm;

pub use context::{ContextState, ExecutionContext};
pub use runtime_error::{RuntimeFault, VmError};
pub use vm::{ContextReport, RunReport, Vm, VmConfig};
