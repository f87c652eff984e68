mod dispatcher;
mod identity_map;

pub use dispatcher::{IgnoreReason, OperationDispatcher, Route};
pub use identity_map::{Assignment, IdentityMap};
