pub mod dispatcher;
pub mod registry;

pub use dispatcher::{fan_out, BroadcastDispatcher};
pub use registry::{ClientId, SubscriptionRegistry, Unsubscription};
