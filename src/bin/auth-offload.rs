use anyhow::Result;
use auth_offload::cli;

// One thread: the dispatcher and every session share a single event loop.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let action = cli::start()?;

    let code = action.execute().await?;

    std::process::exit(code)
}
