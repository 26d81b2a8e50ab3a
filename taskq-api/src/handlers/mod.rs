pub mod events;
pub mod health;
pub mod queues;
pub mod tasks;
pub mod workers;
