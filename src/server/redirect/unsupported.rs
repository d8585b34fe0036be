use std::sync::Arc;

use crate::lb::Pool;

/// Transparent proxying needs Linux socket introspection; everywhere else
/// this fails immediately instead of pretending to listen.
pub async fn listen(_pool: Arc<Pool>, _addr: String) -> anyhow::Result<()> {
    anyhow::bail!("transparent proxying is not supported on this platform")
}
