pub mod model;
pub mod store;

pub use model::User;
pub use store::{InMemoryUserStore, PostgresUserStore, UserStore};
