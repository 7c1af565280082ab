pub mod contacts;
pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod participants;
pub mod rules;
pub mod users;

mod error;
mod mapping;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
