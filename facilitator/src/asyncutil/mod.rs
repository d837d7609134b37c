pub mod future;
pub mod keyed_lock;
