pub mod file;
pub mod job;
