pub mod dispatcher;
pub mod lookup;
pub mod queue;
pub mod reaper;
pub mod tracking;

#[cfg(test)]
pub(crate) mod testing;
