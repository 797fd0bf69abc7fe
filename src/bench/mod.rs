//! Throughput harness: a pool of Workers calling the echo service
//! back-to-back, one shared counter and a Monitor printing how many calls
//! completed in each interval.

pub mod counter;
pub mod generator;
pub mod monitor;
pub mod worker;

pub use generator::LoadGenerator;
pub use monitor::LineReporter;
