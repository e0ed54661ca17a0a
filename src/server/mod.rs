pub mod http;

use crate::config::Config;
use anyhow::Result;

/// Run the HTTP server to completion
pub async fn run(config: Config) -> Result<()> {
    http::serve(config).await
}
