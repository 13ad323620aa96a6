//! IEEE 1800 VPI runtime for statically generated simulation models
//!
//! The generated model registers its scope table and a [`SimulatorModel`]
//! implementation at startup via [`install`]; foreign PLI applications then
//! drive the design through the `vpi_*` C-ABI entry points in [`ffi`]. The
//! driver loop invokes the dispatch passes ([`call_value_change_cbs`],
//! [`call_timed_cbs`], [`call_cbs`]) at the matching phases of each time
//! step.

mod error;
/// C-ABI structs and entry points
pub mod ffi;
mod handle;
/// Model contract: design descriptors and the simulator trait
pub mod model;
/// Runtime installation and dispatch passes
pub mod runtime;
mod schedule;
mod value;

/// Numeric constant families of the standard
pub mod schema {
    /// Object type and method (relation) codes
    pub mod objects;
    /// Property, format, reason, severity, and control codes
    pub mod values;
}

pub use self::model::{Design, Scope, SimulatorModel, StoragePtr, VarKind, Variable};
pub use self::runtime::{
    call_cbs, call_timed_cbs, call_value_change_cbs, install, next_deadline, teardown,
};
pub use self::schema::values::CbReason;
pub use self::value::Lane;
