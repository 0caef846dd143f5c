pub mod inventory_generator;
pub mod writer;
