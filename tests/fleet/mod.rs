//! Behavioural coverage for fleet launches and destroy-all.

mod bdd_steps;
mod scenarios;
mod test_helpers;
