pub mod data;
pub mod io;

pub use data::EngineConfig;
pub use io::ConfigError;

#[cfg(test)]
pub mod tests;
