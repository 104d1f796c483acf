//! Worker execution surface.
//!
//! The worker never reflects over ambient state: everything reachable by name
//! lives in an explicit [`Object`] registry the host populates. Members are
//! plain values, functions (arity + callable) or properties (getter + setter).

mod object;
mod value;

pub use object::{Member, Object, Property, WeakObject};
pub use value::{Callable, Deferred, Function, NotSerializable, Outcome, Value};
