//! The LEET engine: request intake, search fan-out, online probing, session
//! dispatch and completion publication.

mod leet;
pub mod scheduler;

pub use leet::{JobView, Leet, LeetHandle};
pub use scheduler::TimerService;
