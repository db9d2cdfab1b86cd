pub mod deployment;
pub mod diff;
pub mod health;
pub mod manifest;
