//! Delayed notification delivery: queue, channels and the dispatcher that
//! drives jobs from scheduled to delivered or dead-lettered.

pub mod channels;
pub mod clock;
pub mod dispatcher;
pub mod queue;
pub mod scheduler;
pub mod store;
