//! One-shot health query against a running manager.

use anyhow::Context;
use tracing::debug;

use baseappmgr::interface::manager;
use baseappmgr::HealthSummary;
use mercury::{Address, Incoming, InterfaceTable, MercuryError, Nub, NubConfig, NubHandler};

const STATUS_TAG: u64 = 1;

#[derive(Debug, Default)]
struct StatusQuery {
    result: Option<Result<HealthSummary, MercuryError>>,
}

impl NubHandler for StatusQuery {
    fn handle_reply(&mut self, nub: &mut Nub, tag: u64, reply: Result<Incoming, MercuryError>) {
        if tag != STATUS_TAG {
            return;
        }
        self.result = Some(reply.and_then(|msg| msg.args()));
        nub.break_processing();
    }
}

/// Asks the manager at `manager_addr` for its health summary.
pub async fn query_status(config: NubConfig, manager_addr: Address) -> anyhow::Result<HealthSummary> {
    let mut nub = Nub::bind(config).context("Binding status socket")?;
    debug!("Querying {} from {}", manager_addr, nub.local_addr());
    nub.send_request(manager_addr, &manager::CHECK_STATUS, &(), STATUS_TAG)?;

    let mut query = StatusQuery::default();
    let table = InterfaceTable::new("StatusClient");
    nub.run(&mut query, &table).await?;

    match query.result {
        Some(result) => Ok(result.with_context(|| format!("Status query to {manager_addr}"))?),
        None => anyhow::bail!("No status reply from {manager_addr}"),
    }
}

/// Renders a summary as pretty JSON.
pub fn render(summary: &HealthSummary) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}
