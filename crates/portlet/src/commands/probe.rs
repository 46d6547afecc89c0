//! One-shot reachability check.

use std::time::Duration;

use serde::Serialize;

use portlet_core::{CancellationToken, CoreError, Endpoint, Prober, ServiceId};

use crate::cli::{GlobalOpts, ProbeArgs};
use crate::error::CliError;
use crate::output;

use super::Session;

#[derive(Debug, Serialize)]
struct ProbeReport {
    id: ServiceId,
    endpoint: Endpoint,
    url: Option<String>,
}

pub async fn handle(session: &Session, args: ProbeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let id = ServiceId::from(args.id);
    if session.manager.service(&id).is_none() {
        return Err(CoreError::ServiceNotFound { id }.into());
    }

    if args.timeout == Some(0) {
        return Err(CliError::Validation {
            field: "--timeout".into(),
            reason: "must be at least 1 second".into(),
        });
    }
    let timeout = args
        .timeout
        .map_or(session.manager.config().probe_timeout, Duration::from_secs);
    let cancel = CancellationToken::new();
    let probe = session.manager.prober().probe(&id, cancel.clone());

    let endpoint = match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(endpoint)) => endpoint,
        Ok(Err(e)) => {
            return Err(CliError::Unreachable {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            cancel.cancel();
            return Err(CliError::Unreachable {
                id: id.to_string(),
                reason: format!("no answer within {}s", timeout.as_secs()),
            });
        }
    };

    let report = ProbeReport {
        url: endpoint.url(),
        endpoint,
        id,
    };
    let out = output::render_single(
        &global.output,
        &report,
        |r| format!("{} reachable at {}", r.id, r.endpoint),
        |r| r.endpoint.to_string(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
