//! Interactive session: connect services and follow their changes.
//!
//! stdin accepts one intent per line (`enable <id>`, `disable <id>`,
//! `list`, `help`, `quit`). Every change event is printed as it arrives.

use tokio::io::{AsyncBufReadExt, BufReader};

use portlet_core::{ChangeKind, ChangeReason, Command, CommandHandle, ServiceChangeEvent, ServiceId};

use crate::cli::{GlobalOpts, ListArgs, OutputFormat, RunArgs};
use crate::error::CliError;
use crate::output;

use super::{Session, list};

const HELP: &str = "\
enable <id>    connect a service
disable <id>   disconnect a service
list           show every service
quit           end the session";

#[derive(Debug, PartialEq, Eq)]
enum Intent {
    Enable(String),
    Disable(String),
    List,
    Help,
    Quit,
}

/// Parse one stdin line. Blank lines yield `None`.
fn parse_intent(line: &str) -> Result<Option<Intent>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments: {}", line.trim()));
    }

    let intent = match (verb, arg) {
        ("enable" | "connect", Some(id)) => Intent::Enable(id.to_owned()),
        ("disable" | "disconnect", Some(id)) => Intent::Disable(id.to_owned()),
        ("enable" | "connect" | "disable" | "disconnect", None) => {
            return Err(format!("usage: {verb} <service-id>"));
        }
        ("list" | "ls", None) => Intent::List,
        ("help" | "?", None) => Intent::Help,
        ("quit" | "exit", None) => Intent::Quit,
        _ => return Err(format!("unknown command '{verb}', try 'help'")),
    };
    Ok(Some(intent))
}

fn reason_label(reason: &ChangeReason) -> String {
    match reason {
        ChangeReason::Registered => "registered".into(),
        ChangeReason::Updated => "updated".into(),
        ChangeReason::UserEnabled => "requested".into(),
        ChangeReason::UserDisabled => "disconnected by user".into(),
        ChangeReason::ProbeSucceeded => "reachable".into(),
        ChangeReason::ProbeLost => "connection lost".into(),
        ChangeReason::ProbeFatal { message } => format!("unavailable upstream: {message}"),
        ChangeReason::GroupRemoved => "tunnel closed".into(),
        ChangeReason::Removed => "removed".into(),
    }
}

/// One human-readable line per event.
fn describe(event: &ServiceChangeEvent) -> String {
    let time = event.at.format("%H:%M:%S");
    match &event.kind {
        ChangeKind::ServiceUpdated { service } => {
            let endpoint = service
                .endpoint()
                .map(|e| format!(" {e}"))
                .unwrap_or_default();
            format!(
                "{time} {} {}{endpoint} ({})",
                service.id,
                service.status(),
                reason_label(&event.reason)
            )
        }
        ChangeKind::ServiceRemoved { id, .. } => format!("{time} {id} removed"),
        ChangeKind::GroupCreated { group } => format!("{time} group {} created", group.id),
        ChangeKind::GroupRemoved { id } => format!("{time} group {id} removed"),
    }
}

fn print_event(event: &ServiceChangeEvent, global: &GlobalOpts) {
    let line = match global.output {
        OutputFormat::Table | OutputFormat::Plain => describe(event),
        OutputFormat::Json | OutputFormat::JsonCompact | OutputFormat::Yaml => {
            output::render_json_compact(event)
        }
    };
    output::print_output(&line, global.quiet);
}

fn report(err: CliError) {
    eprintln!("{:?}", miette::Report::new(err));
}

async fn apply(
    intent: Intent,
    control: &CommandHandle,
    session: &Session,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match intent {
        Intent::Enable(id) => control.execute(Command::Enable { id: id.into() }).await?,
        Intent::Disable(id) => control.execute(Command::Disable { id: id.into() }).await?,
        Intent::List => list::handle(session, &ListArgs { group: None }, global)?,
        Intent::Help => output::print_output(HELP, global.quiet),
        Intent::Quit => {}
    }
    Ok(())
}

pub async fn handle(session: Session, args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    session.require_services()?;

    let manager = session.manager.clone();
    let mut events = manager.subscribe();
    let control = manager.start_command_processor();

    let initial = session
        .auto_connect
        .iter()
        .cloned()
        .chain(args.connect.iter().map(|id| ServiceId::from(id.as_str())));
    for id in initial {
        if let Err(e) = control.execute(Command::Enable { id }).await {
            manager.shutdown().await;
            return Err(e.into());
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let read_input = !args.no_input;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut missed_reported = 0;

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),

            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                if events.missed() > missed_reported {
                    eprintln!(
                        "{} change events dropped; run 'list' for current state",
                        events.missed() - missed_reported
                    );
                    missed_reported = events.missed();
                }
                print_event(&event, global);
            }

            line = lines.next_line(), if read_input => match line {
                Ok(Some(line)) => match parse_intent(&line) {
                    Ok(Some(Intent::Quit)) => break Ok(()),
                    Ok(Some(intent)) => {
                        if let Err(e) = apply(intent, &control, &session, global).await {
                            report(e);
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => eprintln!("{msg}"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(CliError::Io(e)),
            },
        }
    };

    manager.shutdown().await;
    result
}
