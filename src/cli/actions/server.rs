use crate::{api, cli::actions::Action, gate::GateConfig};
use anyhow::{Context, Result};
use url::Url;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            audit_url,
            csrf_ttl_seconds,
            stepup_window_seconds,
        } => {
            let audit_url = audit_url
                .map(|url| Url::parse(&url).with_context(|| format!("Invalid audit URL: {url}")))
                .transpose()?;

            let config = GateConfig::new()
                .with_csrf_ttl_seconds(csrf_ttl_seconds)
                .with_stepup_window_seconds(stepup_window_seconds)
                .with_audit_url(audit_url);

            api::new(port, dsn, config).await?;
        }
    }

    Ok(())
}
