pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use redis::RedisTaskQueue;
