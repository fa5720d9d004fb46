pub mod engine;
pub mod prompt;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;
