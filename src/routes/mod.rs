pub mod hazards;
pub mod health;
pub mod trajectories;
