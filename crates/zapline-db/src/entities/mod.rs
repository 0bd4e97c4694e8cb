pub mod bots;
pub mod messages;
