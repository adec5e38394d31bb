pub mod clock;
pub mod scheduler;
pub mod store;

pub use clock::*;
pub use scheduler::*;
pub use store::*;
