// Model-based tests for the accounting core.
//
// `model` holds a mirror implementation of the engine's bookkeeping with
// plain u128 arithmetic plus a differential harness that drives the real
// engine and the mirror with the same operation sequence and compares them
// after every step. `proptests` feeds the harness with generated sequences.

pub mod model;

mod proptests;
mod stress;
