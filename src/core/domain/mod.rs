pub mod error;
pub mod hypervisor;
pub mod model;
pub mod value_object;
