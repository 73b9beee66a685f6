//! Sample capture: buffers, the buffer pool, the overflow trigger and the
//! consumer stream.

pub mod control;
pub mod pool;
pub mod record;
pub mod sampler;
pub mod stream;
pub mod trigger;

pub use control::{Control, Knob, Status};
pub use pool::{PoolStats, SampleBufferPool};
pub use record::{Buffer, RecordError, Sample, BUFFER_ENTRIES, NUM_COUNTERS, RECORD_SIZE};
pub use sampler::{Sampler, SoftwareCounters};
pub use stream::{BufferSource, ConsumerStream, DrainedBuffer, RecordReader};
pub use trigger::{CaptureOutcome, CaptureTrigger, CounterSource};
