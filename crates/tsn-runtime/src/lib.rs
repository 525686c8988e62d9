#![doc = "Real-time execution core for phase-staggered TSN publish/subscribe tasks."]

pub mod clock;
pub mod engine;
pub mod executor;
pub mod measurement;
pub mod metrics;
pub mod realtime;
pub mod registry;
pub mod runner;
pub mod shutdown;
pub mod slots;
pub mod txtime;

pub use clock::*;
pub use engine::*;
pub use executor::*;
pub use measurement::*;
pub use metrics::*;
pub use realtime::*;
pub use registry::*;
pub use runner::*;
pub use shutdown::*;
pub use slots::*;
pub use txtime::*;
