mod app;
mod console;
mod msg;

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use anyhow::Result;

use app::App;
use console::ConsoleHost;
use launchbox::plugin::registry::TomlRegistry;
use launchbox::{AppConfig, BuiltinCatalog, PluginManager};
use msg::Msg;

fn main() -> Result<()> {
    // Initialize logging to file (never stdout)
    let log_dir = directories::ProjectDirs::from("", "", "launchbox")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp"));
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "launchbox.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "launchbox=info".into()),
        )
        .init();

    tracing::info!("launchbox starting");

    let config = AppConfig::load()?;
    let registry = Arc::new(TomlRegistry::new(config.plugins_dir(), config.state_path()));
    let host = Arc::new(ConsoleHost::new());
    let manager = PluginManager::start(&config, registry, host.clone(), BuiltinCatalog::bundled());
    let mut app = App::new(manager, host);

    let result = run(&mut app);
    if let Err(e) = &result {
        tracing::error!("launchbox error: {e:?}");
    }
    tracing::info!("launchbox exiting");
    result
}

fn run(app: &mut App) -> Result<()> {
    let (tx, rx) = mpsc::channel::<Msg>();

    // Input thread: one message per stdin line, Quit on EOF.
    let tx_input = tx.clone();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let Some(msg) = Msg::from_line(&line) else {
                continue;
            };
            if tx_input.send(msg).is_err() {
                return;
            }
        }
        let _ = tx_input.send(Msg::Quit);
    });
    drop(tx);

    let mut stdout = io::stdout();
    flush_notifications(app, &mut stdout)?;

    // ── Main event loop ──
    loop {
        let first = rx.recv()?;
        app.update(first);

        while let Ok(msg) = rx.try_recv() {
            app.update(msg);
        }

        flush_notifications(app, &mut stdout)?;
        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn flush_notifications(app: &mut App, out: &mut impl Write) -> Result<()> {
    for line in app.drain_notifications() {
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}
