pub mod breach;
pub mod csrf;
pub mod health;
pub mod reputation;
pub mod stepup;
pub mod types;
