use ordo::Ordo;
use ordo_util_error::WhateverResult;

#[tokio::main]
#[snafu::report]
async fn main() -> WhateverResult<()> {
    Ordo::builder().run().await?;
    Ok(())
}
