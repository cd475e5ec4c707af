use crate::config::GadgetConfig;
use crate::engine::{GadgetCore, PropertiesRequest};
use crate::error::Result;
use crate::handles::BuddyId;
use crate::property::PropertySet;
use crate::protocol::{ViewId, ViewQuery};
use crate::stanza::Element;
use crate::view::ViewState;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub(crate) enum ConnectionCommand {
    SetDirectory(Option<String>),
    EnsureHandle {
        jid: String,
        reply: oneshot::Sender<Result<BuddyId>>,
    },
    InspectHandle {
        buddy: BuddyId,
        reply: oneshot::Sender<Option<String>>,
    },
    CreateView {
        query: ViewQuery,
        reply: oneshot::Sender<Result<ViewId>>,
    },
    CloseView {
        view_id: ViewId,
        reply: oneshot::Sender<Result<()>>,
    },
    ViewMembers {
        view_id: ViewId,
        reply: oneshot::Sender<Result<BTreeSet<BuddyId>>>,
    },
    ViewState {
        view_id: ViewId,
        reply: oneshot::Sender<Result<ViewState>>,
    },
    Properties {
        buddy: BuddyId,
        reply: oneshot::Sender<Result<PropertiesRequest>>,
    },
    Refresh {
        buddy: BuddyId,
        reply: oneshot::Sender<Result<()>>,
    },
    SetProperties {
        properties: PropertySet,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// Runs the core until the last handle is dropped, the inbound stream
/// ends, or a disconnect is requested.
pub(crate) fn spawn_event_loop(
    mut core: GadgetCore,
    config: GadgetConfig,
    mut command_rx: mpsc::Receiver<ConnectionCommand>,
    mut inbound_rx: mpsc::Receiver<Element>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep_timer = tokio::time::interval(config.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Disconnect) => {
                            info!("disconnect requested");
                            break;
                        }
                        Some(cmd) => handle_command(&mut core, cmd),
                        None => {
                            debug!("all gadget handles dropped");
                            break;
                        }
                    }
                }
                stanza = inbound_rx.recv() => {
                    match stanza {
                        Some(stanza) => core.handle_stanza(&stanza),
                        None => {
                            info!("inbound stream closed");
                            break;
                        }
                    }
                }
                _ = sweep_timer.tick() => {
                    core.sweep(Instant::now());
                }
            }
        }

        core.disconnect();
    })
}

fn handle_command(core: &mut GadgetCore, cmd: ConnectionCommand) {
    match cmd {
        ConnectionCommand::SetDirectory(jid) => core.set_directory(jid.as_deref()),
        ConnectionCommand::EnsureHandle { jid, reply } => {
            let _ = reply.send(core.ensure_handle(&jid));
        }
        ConnectionCommand::InspectHandle { buddy, reply } => {
            let _ = reply.send(core.inspect_handle(buddy));
        }
        ConnectionCommand::CreateView { query, reply } => {
            let _ = reply.send(core.create_view(query));
        }
        ConnectionCommand::CloseView { view_id, reply } => {
            let _ = reply.send(core.close_view(view_id));
        }
        ConnectionCommand::ViewMembers { view_id, reply } => {
            let _ = reply.send(core.view_members(view_id));
        }
        ConnectionCommand::ViewState { view_id, reply } => {
            let _ = reply.send(core.view_state(view_id));
        }
        ConnectionCommand::Properties { buddy, reply } => {
            let _ = reply.send(core.request_properties(buddy, Instant::now()));
        }
        ConnectionCommand::Refresh { buddy, reply } => {
            let _ = reply.send(core.refresh(buddy, Instant::now(), None));
        }
        ConnectionCommand::SetProperties { properties, reply } => {
            let _ = reply.send(core.set_own_properties(properties));
        }
        ConnectionCommand::Disconnect => {}
    }
}
