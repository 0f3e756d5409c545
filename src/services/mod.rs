pub mod context;
pub mod executor;
pub mod grouper;
pub mod history;
pub mod planner;
pub mod store;

#[cfg(test)]
pub(crate) mod fixtures;
