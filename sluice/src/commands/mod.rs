pub mod download;
pub mod serve;
