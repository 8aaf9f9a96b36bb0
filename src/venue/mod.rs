pub mod client;
pub mod warmers;
