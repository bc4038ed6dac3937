pub mod app_kernel;
pub mod health;
pub mod service;

pub use app_kernel::AppKernel;
pub use health::HealthSnapshot;
pub use service::{Service, Supervisor};
