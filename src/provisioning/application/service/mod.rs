pub mod fleet_orchestrator;
pub mod guest_baseline;
pub mod identity_allocator;
pub mod lifecycle_driver;
