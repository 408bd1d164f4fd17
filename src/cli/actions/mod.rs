pub mod worker;

// Internal "interpreter" for `Action`.
mod run;

#[derive(Debug)]
pub enum Action {
    Worker(worker::Args),
}

impl Action {
    /// Execute the action and return the process exit code.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<i32> {
        run::execute(self).await
    }
}
