// Step model, execution and scheduling

pub mod executor;
pub mod scheduler;
pub mod step;

pub use executor::*;
pub use scheduler::*;
pub use step::*;
