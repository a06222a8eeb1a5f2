pub mod buffer_pool;
pub mod device;
pub mod pipeline;

pub use buffer_pool::BufferPool;
pub use device::init_gpu;
pub use pipeline::PipelineManager;
