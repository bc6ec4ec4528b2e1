/// Native module contains implementations of core traits
/// without using any external dependencies like Docker or Runc,
/// launching toolchains as plain child processes instead.
pub mod executor;
pub mod languages;
pub mod process;
