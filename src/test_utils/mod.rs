// Test support for the data-access core

pub mod memory_store;
