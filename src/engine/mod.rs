//! The execution core: bindings, units, and the registry.
//!
//! One [`ExecutionUnit`] runs the control loop for one applet: it polls the
//! action binding, and on a trigger invokes every reaction binding in order,
//! refreshing credentials just-in-time before each call. The [`Registry`]
//! owns every live unit and guarantees at most one per applet.

pub mod binding;
pub mod registry;
pub mod runlog;
pub mod unit;

pub use binding::{Binding, BuildError};
pub use registry::{Registry, RegistryError};
pub use runlog::RunLog;
pub use unit::{ExecutionUnit, UnitHandles};
