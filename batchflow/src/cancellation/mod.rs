//! Cooperative stop signalling for running executions.

mod token;

pub use token::CancellationToken;
