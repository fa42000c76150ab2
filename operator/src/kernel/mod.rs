pub mod engine;
pub mod fiber;
pub mod gate;
pub mod packet;
pub mod step;

pub use engine::Engine;
pub use fiber::{Fiber, FiberOutcome, FiberStatus};
pub use gate::FiberGate;
pub use packet::{DeferredRoll, Packet, Topology};
pub use step::{NextAction, Step, StepRef, run_chain};
