//! The composition root's view of the server.
//!
//! `main` constructs every collaborator exactly once and threads them
//! through this context; there are no process-wide singletons. Workers share
//! the context behind an `Arc`.

use crate::dispatch::CommandTables;
use crate::groups::GroupManager;
use crate::net::registry::ClientRegistry;
use crate::script::ScriptBridge;
use crate::store::UserStore;
use crate::ClientId;
use ember::logging::{self, Logger};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct ServerContext {
    pub clients: Arc<ClientRegistry>,
    pub groups: GroupManager,
    pub store: Box<dyn UserStore>,
    pub scripts: ScriptBridge,
    pub commands: CommandTables,
    pub log: Logger,
    /// Raised by the termination signal handler; observed by the event loop.
    pub shutdown: Arc<AtomicBool>,
}

impl ServerContext {
    /// Announce the departure of an authenticated connection and mark it for
    /// teardown. The actual deregister-and-close happens on the event loop's
    /// next sweep.
    pub fn disconnect_client(&self, id: ClientId) {
        if let Some(nickname) = self.clients.nickname_of(id) {
            if !nickname.is_empty() {
                logging::info!(self.log, "client left"; "client_id" => id, "nickname" => nickname.as_str());
                self.clients.broadcast(&format!("{} 退出聊天室", nickname), Some(id));
            }
        }
        self.clients.mark_for_removal(id);
    }
}
