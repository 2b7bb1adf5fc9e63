//! Scenario-based tests for mimir fleets

mod helpers;

mod concurrency;
mod deploy_failure;
mod end_to_end;
mod isolation;
mod retry_behavior;
