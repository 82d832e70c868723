//! The parlor chat server daemon.
//!
//! The composition root: loads the `.env` configuration, builds the logger,
//! connects the credential store, restores the group snapshot, wires every
//! collaborator into a `ServerContext` and hands it to the event loop.
//! SIGINT flips the shutdown flag; the loop exits and state is persisted.

use ember::logging::{self, Level};
use parlor::config::{Config, DEFAULT_ENV_PATH};
use parlor::context::ServerContext;
use parlor::dispatch::CommandTables;
use parlor::groups::GroupManager;
use parlor::net::registry::ClientRegistry;
use parlor::net::server::EventLoop;
use parlor::pool::WorkerPool;
use parlor::script::ScriptBridge;
use parlor::snapshot;
use parlor::store::MysqlStore;
use std::net::SocketAddr;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const WORKER_COUNT: usize = 4;

fn main() {
    if let Err(code) = run() {
        process::exit(code);
    }
}

fn run() -> Result<(), i32> {
    // A peer closing mid-write must surface as an io error, not kill the
    // process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let config = match Config::load(Path::new(DEFAULT_ENV_PATH)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("FATAL: configuration error: {}", err);
            return Err(1);
        }
    };

    let log = match logging::build_logger(Level::Info, config.log_file.as_deref()) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("FATAL: cannot initialize logging: {}", err);
            return Err(1);
        }
    };

    let store = match MysqlStore::connect(&config.db, &log) {
        Ok(store) => store,
        Err(err) => {
            logging::crit!(log, "credential store unavailable"; "error" => %err);
            return Err(1);
        }
    };

    let clients = Arc::new(ClientRegistry::new(&log));

    let snapshot_path = Path::new(snapshot::DEFAULT_PATH);
    let groups = GroupManager::new(
        snapshot::load(snapshot_path, &log),
        Arc::clone(&clients),
        &log,
    );

    let scripts = match ScriptBridge::new(Arc::clone(&clients), &log) {
        Ok(scripts) => scripts,
        Err(err) => {
            logging::crit!(log, "cannot initialize script bridge"; "error" => %err);
            return Err(1);
        }
    };
    if let Err(err) = scripts.load_script(&config.script_file) {
        logging::error!(log, "operator script failed to load, scripted commands disabled";
                        "error" => %err);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            logging::crit!(log, "cannot install signal handler"; "error" => %err);
            return Err(1);
        }
    }

    let ctx = Arc::new(ServerContext {
        clients,
        groups,
        store: Box::new(store),
        scripts,
        commands: CommandTables::new(),
        log: log.clone(),
        shutdown,
    });

    let pool = WorkerPool::new(WORKER_COUNT, &log);
    let addr = SocketAddr::from(([0, 0, 0, 0], parlor::LISTEN_PORT));
    let mut event_loop = match EventLoop::bind(addr, Arc::clone(&ctx), pool, &log) {
        Ok(event_loop) => event_loop,
        Err(err) => {
            logging::crit!(log, "cannot bind listener"; "port" => parlor::LISTEN_PORT, "error" => %err);
            return Err(1);
        }
    };

    let result = event_loop.run();
    event_loop.shutdown(snapshot_path);

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            logging::crit!(log, "event loop failed"; "error" => %err);
            Err(1)
        }
    }
}
