pub mod client;
pub mod context;
pub mod hash;
pub mod watcher;

pub use client::{KubePodClient, PodClient};
pub use context::{PodStep, PodStepContext, RollCycleStep};
pub use hash::pod_hash;
pub use watcher::PodWatcher;
