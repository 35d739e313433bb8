pub mod engine;
pub mod session;
pub mod transport;

pub use engine::MessageEngine;
pub use session::{Session, SessionMode};
