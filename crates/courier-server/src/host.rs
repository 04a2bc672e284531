//! Host dispatch loop.

use crate::server::{Server, ServerError};
use courier_core::{HostContext, HostDirective};

/// Run the servers of one host until its inbox closes.
///
/// Announces every server to the broker, then routes each directive to the
/// server whose contract it names. Co-hosted servers share the inbox.
pub async fn serve(mut ctx: HostContext, servers: Vec<Server>) {
    tracing::info!(
        location = %ctx.location,
        kind = %ctx.kind,
        contracts = ?servers.iter().map(Server::name).collect::<Vec<_>>(),
        "host started"
    );

    for server in &servers {
        if let Err(e) = server.announce() {
            tracing::error!(contract = %server.name(), "failed to announce server: {}", e);
        }
    }

    while let Some(directive) = ctx.inbox.recv().await {
        let Some(server) = servers.iter().find(|s| s.name() == directive.contract()) else {
            tracing::warn!(
                location = %ctx.location,
                contract = %directive.contract(),
                "directive for a contract this host does not serve"
            );
            continue;
        };

        if let Err(e) = apply(server, directive) {
            tracing::error!(contract = %server.name(), "{}", e);
        }
    }

    tracing::debug!(location = %ctx.location, "host inbox closed");
}

fn apply(server: &Server, directive: HostDirective) -> Result<(), ServerError> {
    match directive {
        HostDirective::Register { uuid, .. } => server.register_client(uuid),
        HostDirective::Unregister { uuid, .. } => server.unregister_client(uuid),
        HostDirective::Announce { .. } => server.announce(),
    }
}
