pub mod command;
pub mod layout;
pub mod locker;
pub mod restic;
pub mod store;

// Trait-based abstractions for testability
pub mod restic_ops;
pub mod system;

// Re-export commonly used types and traits (used by test crate)
pub use layout::DataLayout;
pub use restic_ops::{RealResticOps, ResticOperations};
pub use system::{RealSystemOps, SystemOperations};
