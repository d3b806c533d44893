pub mod backup;
pub mod ignore;
pub mod logging;
pub mod notification;
pub mod progress;
pub mod repository;
pub mod restore;
pub mod scheduler;
