//! Service listing.

use serde::Serialize;
use tabled::Tabled;

use portlet_core::{ConnectionStatus, Endpoint, GroupId, Service, ServiceSnapshot};

use crate::cli::{GlobalOpts, ListArgs};
use crate::error::CliError;
use crate::output;

use super::Session;

/// One service as the CLI presents it: the core snapshot plus the
/// configured target.
#[derive(Debug, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub snapshot: ServiceSnapshot,
    pub status: ConnectionStatus,
    pub target: String,
    pub auto_connect: bool,
    #[serde(skip)]
    pub endpoint: Option<Endpoint>,
}

impl ServiceView {
    pub fn new(service: &Service, session: &Session) -> Self {
        let configured = session.config.find_service(service.id.as_str()).map(|(_, s)| s);
        Self {
            snapshot: service.snapshot(),
            status: service.status(),
            target: configured.map(|s| s.target.clone()).unwrap_or_default(),
            auto_connect: configured.is_some_and(|s| s.auto_connect),
            endpoint: service.endpoint().cloned(),
        }
    }
}

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Status")]
    status: String,
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(session: &Session, args: &ListArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let store = session.manager.store();
    let groups: Vec<GroupId> = match &args.group {
        Some(id) => {
            let id = GroupId::from(id.as_str());
            if store.group(&id).is_none() {
                return Err(CliError::NotFound {
                    resource_type: "group".into(),
                    identifier: id.to_string(),
                    list_command: "config show".into(),
                });
            }
            vec![id]
        }
        None => store.groups().iter().map(|g| g.id.clone()).collect(),
    };

    let views: Vec<ServiceView> = groups
        .iter()
        .flat_map(|g| store.list(g))
        .map(|s| ServiceView::new(&s, session))
        .collect();

    let color = output::should_color(&global.color);
    let out = output::render_list(
        &global.output,
        &views,
        |v| ServiceRow {
            id: v.snapshot.id.to_string(),
            name: v.snapshot.source_name.clone(),
            group: v.snapshot.group_id.to_string(),
            target: v.target.clone(),
            status: output::paint_status(v.status, color),
        },
        |v| v.snapshot.id.to_string(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
