pub mod in_memory;
pub mod mock;
#[cfg(feature = "rocksdb-backend")]
pub mod rocksdb;
