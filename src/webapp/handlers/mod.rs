pub mod delete;
pub mod health;
pub mod jobs;
pub mod output;
