pub mod consumer;
pub mod error;
pub mod memory;
pub mod parser;
pub mod redis_queue;

pub use consumer::{QueueConsumer, QueueHealth, QueueMessage, QueueProducer};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use parser::{encode_job_record, parse_batch, parse_job_record};
pub use redis_queue::RedisQueue;
