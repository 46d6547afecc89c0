//! Single-service detail view.

use std::fmt::Write;

use portlet_core::{CoreError, ServiceId};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

use super::Session;
use super::list::ServiceView;

fn detail(view: &ServiceView, color: bool) -> String {
    let s = &view.snapshot;
    let mut out = String::new();
    let _ = writeln!(out, "ID:           {}", s.id);
    let _ = writeln!(out, "Name:         {}", s.source_name);
    let _ = writeln!(out, "Group:        {}", s.group_id);
    let _ = writeln!(out, "Target:       {}", view.target);
    let _ = writeln!(out, "Auto-connect: {}", view.auto_connect);
    let _ = write!(out, "Status:       {}", output::paint_status(view.status, color));
    if let Some(endpoint) = &view.endpoint {
        let _ = write!(out, "\nAddress:      {}", endpoint.socket_address());
        if let Some(url) = endpoint.url() {
            let _ = write!(out, "\nURL:          {url}");
        }
    }
    out
}

pub fn handle(session: &Session, id: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let id = ServiceId::from(id);
    let service = session
        .manager
        .service(&id)
        .ok_or(CoreError::ServiceNotFound { id })?;

    let view = ServiceView::new(&service, session);
    let color = output::should_color(&global.color);
    let out = output::render_single(
        &global.output,
        &view,
        |v| detail(v, color),
        |v| v.snapshot.id.to_string(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
