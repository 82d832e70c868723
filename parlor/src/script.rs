//! Operator scripting bridge.
//!
//! A Lua interpreter owned by the server lets operators register extra text
//! commands without recompiling: a global function named `lua_cmd_<name>`
//! handles `/<name>`. Scripts get a `chat` table with a `broadcast(sender,
//! message)` function for fanning text out to every connection.
//!
//! The bridge holds its own mutex around the interpreter. Its callbacks
//! acquire the connection-table lock themselves, so the dispatcher must not
//! (and does not) call into the bridge while holding that lock.

use crate::net::registry::ClientRegistry;
use ember::logging::{self, Logger};
use mlua::{Function, Lua};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script engine error: {0}")]
    Lua(#[from] mlua::Error),
    #[error("cannot read script file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ScriptBridge {
    lua: Mutex<Lua>,
    log: Logger,
}

impl ScriptBridge {
    pub fn new(registry: Arc<ClientRegistry>, log: &Logger) -> Result<ScriptBridge, ScriptError> {
        let log = log.new(logging::o!("mod" => "script"));
        let lua = Lua::new();

        {
            let chat = lua.create_table()?;
            let broadcast_log = log.clone();
            let broadcast = lua.create_function(move |_, (sender, message): (String, String)| {
                let line = format!("[{}(lua)]: {}", sender, message);
                logging::info!(broadcast_log, "script broadcast"; "sender" => sender.as_str());
                registry.broadcast(&line, None);
                Ok(())
            })?;
            chat.set("broadcast", broadcast)?;
            lua.globals().set("chat", chat)?;
        }

        Ok(ScriptBridge { lua: Mutex::new(lua), log })
    }

    /// Load the operator command script. A missing file only disables
    /// scripted commands; a broken script is an error.
    pub fn load_script(&self, path: &Path) -> Result<(), ScriptError> {
        if !path.exists() {
            logging::warn!(self.log, "script file not found, scripted commands disabled";
                           "path" => %path.display());
            return Ok(());
        }

        let source = fs::read_to_string(path)?;
        let lua = self.lua.lock();
        lua.load(&source).set_name(path.to_string_lossy()).exec()?;

        logging::info!(self.log, "operator script loaded"; "path" => %path.display());
        Ok(())
    }

    /// Try to handle `command` with a script-registered handler. Returns
    /// whether the command was handled; a script error counts as handled
    /// (and is logged), an unregistered command does not.
    pub fn dispatch(&self, nickname: &str, command: &str, args: &[&str]) -> bool {
        let lua = self.lua.lock();
        let global_name = format!("lua_cmd_{}", command.trim_start_matches('/'));

        let handler: Function = match lua.globals().get(global_name.as_str()) {
            Ok(handler) => handler,
            Err(_) => return false,
        };

        let called = lua
            .create_sequence_from(args.iter().copied())
            .and_then(|args_table| handler.call::<()>((nickname, args_table)));

        if let Err(err) = called {
            logging::error!(self.log, "script command failed";
                            "command" => command, "error" => %err);
        }
        true
    }
}
