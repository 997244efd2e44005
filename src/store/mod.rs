//! Container stores.
//!
//! Two stores split the lifecycle at the runtime boundary:
//!
//! | Store | States held | Runtime object |
//! |---|---|---|
//! | [`AllocationStore`] | Reserved, Initializing | no |
//! | [`ContainerStore`] | Created, Running, Completed | yes |
//!
//! Both share one [`CapacityAccountant`](crate::capacity::CapacityAccountant):
//! capacity is claimed at reservation and travels with the container into
//! the runtime-backed store, returning to the pool only when the entry
//! leaves whichever store holds it.

mod allocation;
mod containers;
mod supervisor;

pub use allocation::AllocationStore;
pub use containers::{ContainerStore, ContainerStoreConfig};
