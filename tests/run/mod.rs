//! Behavioural coverage for single separation runs.

mod bdd_steps;
mod scenarios;
mod test_helpers;
