use crate::cli::actions::{worker, Action};
use anyhow::Result;

/// Execute the provided action.
// This is the single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<i32> {
    match action {
        Action::Worker(args) => worker::execute(args).await,
    }
}
