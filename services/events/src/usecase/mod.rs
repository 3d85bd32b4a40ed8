pub mod backoff;
pub mod consume;
pub mod dedup;
pub mod dispatch;
pub mod events;
pub mod publish;
pub mod relay;
