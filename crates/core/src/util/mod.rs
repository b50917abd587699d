pub mod retry;
pub mod ring_buffer;
pub mod single_flight;

pub use retry::{is_http_retryable, retry_with_backoff, RetryConfig};
pub use ring_buffer::RingBuffer;
pub use single_flight::{SingleFlight, Ticket};
