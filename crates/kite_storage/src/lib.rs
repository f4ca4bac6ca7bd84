pub mod driver;
pub mod lsm;
pub mod mem;
pub mod sled_driver;

pub use driver::{DriverCaps, KvDriver, ReadView};
pub use lsm::LsmDriver;
pub use mem::MemDriver;
pub use sled_driver::SledDriver;
