pub mod api;

use anyhow::Result;

pub use api::{router, serve_on, RelayState};

pub async fn start(port: u16) -> Result<()> {
    api::serve(port).await
}
