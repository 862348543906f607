//! Built-in `StorageDevice` implementations.
//!
//! [`memory::CpuRamDevice`] and [`file::SerializationFileDevice`] are the
//! leaf devices; [`recency::SimpleRecencyAllocator`] is the composite that
//! schedules migrations between a pair of them.

pub mod file;
pub mod memory;
pub mod recency;
