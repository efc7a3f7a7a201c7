mod consumer;
mod node_id;
mod pool;

pub use consumer::Worker;
pub use node_id::NodeIdAllocator;
pub use pool::WorkerPool;
