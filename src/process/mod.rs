pub mod escalation;
pub mod handle;
pub mod queue;

#[cfg(test)]
mod queue_test;
