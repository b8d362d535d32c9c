// Queue module: causality envelopes and NATS JetStream invocation publishing

pub mod causality;
pub mod nats;
pub mod publisher;

pub use causality::{CausalityCodec, CausalityToken};
pub use nats::NatsClient;
pub use publisher::{InvocationMessage, NatsInvocationPublisher};
