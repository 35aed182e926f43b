pub mod health;
pub mod paid;
pub mod sessions;
pub mod usage;
